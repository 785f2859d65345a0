//! Idle holder: one session, no statements

use std::sync::Arc;

use tracing::{debug, warn};

use super::{connect_until_shutdown, idle_label};
use crate::gateway::Gateway;
use crate::shutdown::ShutdownListener;

/// Hold an idle session until shutdown
pub async fn run(gateway: Arc<dyn Gateway>, wid: usize, shutdown: ShutdownListener) {
    let label = idle_label(wid);

    let session = match connect_until_shutdown(gateway.as_ref(), &label, &shutdown).await {
        None => return,
        Some(Ok(session)) => session,
        Some(Err(e)) => {
            warn!(task = %label, error = %e, "Idle holder could not connect");
            return;
        }
    };
    debug!(task = %label, "Holding idle session");

    shutdown.wait().await;

    if let Err(e) = session.close().await {
        debug!(task = %label, error = %e, "Error closing idle session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{state, InMemoryGateway, Operation};
    use crate::shutdown::Shutdown;

    #[tokio::test]
    async fn test_holds_idle_session_until_shutdown() {
        let gateway = InMemoryGateway::new();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(run(Arc::new(gateway.clone()), 7, shutdown.listener()));

        while gateway.open_sessions_labeled("pgload-idle-07") == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.histogram().count(state::IDLE), 1);

        shutdown.trigger();
        task.await.unwrap();

        assert_eq!(gateway.open_sessions(), 0);
        let operations: Vec<_> = gateway.events().into_iter().map(|e| e.operation).collect();
        assert_eq!(operations, vec![Operation::Connect, Operation::Close]);
    }

    #[tokio::test]
    async fn test_connect_failure_ends_task() {
        let gateway = InMemoryGateway::new();
        gateway.fail_connections_labeled("pgload-idle");
        let shutdown = Shutdown::new();

        run(Arc::new(gateway.clone()), 0, shutdown.listener()).await;
        assert_eq!(gateway.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_opens_nothing() {
        let gateway = InMemoryGateway::new();
        let shutdown = Shutdown::new();
        shutdown.trigger();

        run(Arc::new(gateway.clone()), 0, shutdown.listener()).await;
        assert_eq!(gateway.event_count(), 0);
    }
}
