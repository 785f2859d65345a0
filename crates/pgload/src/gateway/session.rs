//! Gateway and Session trait definitions

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Session states as reported by `pg_stat_activity.state`
pub mod state {
    /// Session is waiting for a new client command
    pub const IDLE: &str = "idle";
    /// Session is executing a statement
    pub const ACTIVE: &str = "active";
    /// Session is inside a transaction but not executing a statement
    pub const IDLE_IN_TRANSACTION: &str = "idle in transaction";
    /// Inside a transaction in which a statement failed
    pub const IDLE_IN_TRANSACTION_ABORTED: &str = "idle in transaction (aborted)";
    /// Placeholder for background workers, whose state column is NULL
    pub const BACKGROUND: &str = "bg";
}

/// Error type for gateway operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Connection string could not be parsed
    #[error("invalid connection string: {0}")]
    InvalidDsn(String),

    /// Connection could not be established
    #[error("connect failed for {label}: {reason}")]
    Connect { label: String, reason: String },

    /// Statement, commit or rollback failed
    #[error("statement failed: {0}")]
    Statement(String),

    /// Session was already closed or lost
    #[error("session closed")]
    Closed,
}

/// Per-state session counts, ordered by count descending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHistogram {
    entries: Vec<(String, i64)>,
}

impl StateHistogram {
    /// Build a histogram from `(state, count)` pairs
    ///
    /// Duplicate states are summed. Ties are ordered by state name so that
    /// rendering is stable.
    pub fn from_counts<I, S>(counts: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mut entries: Vec<(String, i64)> = Vec::new();
        for (state, count) in counts {
            let state = state.into();
            match entries.iter_mut().find(|(s, _)| *s == state) {
                Some((_, n)) => *n += count,
                None => entries.push((state, count)),
            }
        }
        entries.sort_by(|(sa, na), (sb, nb)| nb.cmp(na).then_with(|| sa.cmp(sb)));
        Self { entries }
    }

    /// Number of sessions in `state` (0 when absent)
    pub fn count(&self, state: &str) -> i64 {
        self.entries
            .iter()
            .find(|(s, _)| s == state)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /// Total number of sessions across all states
    pub fn total(&self) -> i64 {
        self.entries.iter().map(|(_, n)| n).sum()
    }

    pub fn entries(&self) -> &[(String, i64)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for StateHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (state, count)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("  ")?;
            }
            write!(f, "{state}:{count}")?;
        }
        Ok(())
    }
}

/// Opens labeled database sessions
///
/// The label ends up as the server-side `application_name`, which is how a
/// monitor tells the load populations apart.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Open a new session
    async fn connect(&self, label: &str) -> Result<Box<dyn Session>, GatewayError>;
}

/// One exclusively owned database session
///
/// Transaction handling follows the classic driver model: with auto-commit
/// disabled, the first statement implicitly opens a transaction that stays
/// open until [`Session::commit`] or [`Session::rollback`].
#[async_trait]
pub trait Session: Send {
    /// Label the session was opened with
    fn label(&self) -> &str;

    /// Whether the session can no longer be used (lost socket, protocol error)
    fn is_broken(&self) -> bool;

    /// Enable or disable auto-commit for subsequent statements
    fn set_autocommit(&mut self, enabled: bool);

    /// Run one statement and drain its result set, returning the row count
    async fn execute(&mut self, sql: &str) -> Result<u64, GatewayError>;

    /// Commit the open transaction, if any
    async fn commit(&mut self) -> Result<(), GatewayError>;

    /// Roll back the open transaction, if any
    async fn rollback(&mut self) -> Result<(), GatewayError>;

    /// Session counts grouped by state, excluding this session
    async fn session_states(&mut self) -> Result<StateHistogram, GatewayError>;

    /// Close the session
    async fn close(self: Box<Self>) -> Result<(), GatewayError>;
}
