//! Idle-in-transaction holder: opens a transaction and never commits it

use std::sync::Arc;

use tracing::{debug, warn};

use super::{connect_until_shutdown, idle_in_tx_label};
use crate::gateway::Gateway;
use crate::queries::OPEN_TRANSACTION_SQL;
use crate::shutdown::ShutdownListener;

/// Hold an open transaction until shutdown, then roll it back
pub async fn run(gateway: Arc<dyn Gateway>, wid: usize, shutdown: ShutdownListener) {
    let label = idle_in_tx_label(wid);

    let mut session = match connect_until_shutdown(gateway.as_ref(), &label, &shutdown).await {
        None => return,
        Some(Ok(session)) => session,
        Some(Err(e)) => {
            warn!(task = %label, error = %e, "Idle-in-transaction holder could not connect");
            return;
        }
    };

    if shutdown.is_shutdown() {
        if let Err(e) = session.close().await {
            debug!(task = %label, error = %e, "Error closing session");
        }
        return;
    }

    session.set_autocommit(false);
    match session.execute(OPEN_TRANSACTION_SQL).await {
        Ok(_) => {
            debug!(task = %label, "Holding open transaction");
            shutdown.wait().await;
            if let Err(e) = session.rollback().await {
                warn!(task = %label, error = %e, "Rollback failed");
            }
        }
        Err(e) => {
            warn!(task = %label, error = %e, "Could not open transaction");
        }
    }

    if let Err(e) = session.close().await {
        debug!(task = %label, error = %e, "Error closing session");
    }
}
