//! Scratch table the active workers read and write

use tracing::info;

use crate::gateway::{Gateway, GatewayError, Session};

pub const SCRATCH_TABLE: &str = "pgload_scratch";

/// Label of the setup session
pub const SETUP_LABEL: &str = "pgload-setup";

/// Label of the teardown session
pub const TEARDOWN_LABEL: &str = "pgload-teardown";

/// Rows seeded by [`setup`]
pub const SEED_ROWS: u32 = 500;

const CREATE_SQL: &str = "CREATE TABLE IF NOT EXISTS pgload_scratch (\
     id SERIAL PRIMARY KEY, \
     val DOUBLE PRECISION, \
     ts TIMESTAMPTZ DEFAULT now())";

const TRUNCATE_SQL: &str = "TRUNCATE pgload_scratch";

const DROP_SQL: &str = "DROP TABLE IF EXISTS pgload_scratch";

fn seed_sql() -> String {
    format!(
        "INSERT INTO pgload_scratch (val) \
         SELECT random()*1000 FROM generate_series(1, {SEED_ROWS})"
    )
}

/// Create (or empty) the scratch table and seed it
pub async fn setup(gateway: &dyn Gateway) -> Result<(), GatewayError> {
    let mut session = gateway.connect(SETUP_LABEL).await?;
    session.set_autocommit(true);
    let result = seed(&mut *session).await;
    let closed = session.close().await;
    result?;
    closed?;

    info!(table = SCRATCH_TABLE, rows = SEED_ROWS, "Scratch table ready");
    Ok(())
}

async fn seed(session: &mut dyn Session) -> Result<(), GatewayError> {
    session.execute(CREATE_SQL).await?;
    session.execute(TRUNCATE_SQL).await?;
    session.execute(&seed_sql()).await?;
    Ok(())
}

/// Drop the scratch table
pub async fn teardown(gateway: &dyn Gateway) -> Result<(), GatewayError> {
    let mut session = gateway.connect(TEARDOWN_LABEL).await?;
    session.set_autocommit(true);
    let result = session.execute(DROP_SQL).await;
    let closed = session.close().await;
    result?;
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InMemoryGateway, Operation};

    #[tokio::test]
    async fn test_setup_creates_truncates_and_seeds() {
        let gateway = InMemoryGateway::new();
        setup(&gateway).await.unwrap();

        let statements: Vec<_> = gateway
            .events()
            .into_iter()
            .filter_map(|e| match e.operation {
                Operation::Execute(sql) => Some(sql),
                _ => None,
            })
            .collect();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS pgload_scratch"));
        assert_eq!(statements[1], TRUNCATE_SQL);
        assert!(statements[2].contains("generate_series(1, 500)"));
        assert_eq!(gateway.open_sessions(), 0);
        assert_eq!(gateway.commits_labeled(SETUP_LABEL), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_still_closes_session() {
        let gateway = InMemoryGateway::new();
        gateway.fail_statements_containing("TRUNCATE");

        assert!(setup(&gateway).await.is_err());
        assert_eq!(gateway.open_sessions(), 0);
        assert_eq!(gateway.statements_containing("INSERT"), 0);
    }

    #[tokio::test]
    async fn test_teardown_drops_table() {
        let gateway = InMemoryGateway::new();
        teardown(&gateway).await.unwrap();
        assert_eq!(gateway.statements_containing(DROP_SQL), 1);
        assert_eq!(gateway.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_teardown_connect_failure_is_returned() {
        let gateway = InMemoryGateway::new();
        gateway.fail_connections_labeled(TEARDOWN_LABEL);
        assert!(matches!(
            teardown(&gateway).await,
            Err(GatewayError::Connect { .. })
        ));
    }
}
