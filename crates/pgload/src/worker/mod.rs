//! Long-lived load tasks
//!
//! Each population is one function that runs until the shared shutdown
//! listener fires:
//!
//! - [`idle::run`] holds a session that never issues a statement
//! - [`idle_in_tx::run`] holds a session with an open, never committed transaction
//! - [`active::ActiveWorker`] borrows pooled sessions and runs queries

pub mod active;
pub mod idle;
pub mod idle_in_tx;

pub use active::{ActiveWorker, Iteration};

use crate::gateway::{Gateway, GatewayError, Session};
use crate::shutdown::ShutdownListener;

/// Label of idle holder `wid`
pub fn idle_label(wid: usize) -> String {
    format!("pgload-idle-{wid:02}")
}

/// Label of idle-in-transaction holder `wid`
pub fn idle_in_tx_label(wid: usize) -> String {
    format!("pgload-itx-{wid:02}")
}

/// Open a session unless shutdown fires first
///
/// Returns `None` when shutdown won; the pending connect is dropped.
pub(crate) async fn connect_until_shutdown(
    gateway: &dyn Gateway,
    label: &str,
    shutdown: &ShutdownListener,
) -> Option<Result<Box<dyn Session>, GatewayError>> {
    tokio::select! {
        biased;
        _ = shutdown.wait() => None,
        result = gateway.connect(label) => Some(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_zero_padded() {
        assert_eq!(idle_label(3), "pgload-idle-03");
        assert_eq!(idle_label(29), "pgload-idle-29");
        assert_eq!(idle_in_tx_label(0), "pgload-itx-00");
        assert_eq!(idle_in_tx_label(120), "pgload-itx-120");
    }
}
