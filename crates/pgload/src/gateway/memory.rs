//! In-memory implementation of Gateway for testing
//!
//! Models just enough of the server to observe what the load generator does:
//! each session has a `pg_stat_activity`-style state, transactions are tracked
//! per session, and every call is appended to an operation log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::session::{state, Gateway, GatewayError, Session, StateHistogram};

/// Kind of call recorded in the operation log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Execute(String),
    Commit,
    Rollback,
    SessionStates,
    /// Explicit close
    Close,
    /// Session dropped without an explicit close
    Disconnect,
}

/// One entry of the operation log
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub session_id: u64,
    pub label: String,
    pub operation: Operation,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    label: String,
    state: &'static str,
    open: bool,
    commits: u32,
    rollbacks: u32,
}

#[derive(Default)]
struct Inner {
    sessions: Mutex<HashMap<u64, SessionRecord>>,
    events: Mutex<Vec<GatewayEvent>>,
    next_id: AtomicU64,
    failing_labels: Mutex<Vec<String>>,
    failing_statements: Mutex<Vec<String>>,
    breaking_statements: Mutex<Vec<String>>,
    statement_delay: Mutex<Duration>,
}

impl Inner {
    fn record(&self, session_id: u64, label: &str, operation: Operation) {
        self.events.lock().push(GatewayEvent {
            session_id,
            label: label.to_string(),
            operation,
        });
    }

    fn set_state(&self, session_id: u64, new_state: &'static str) {
        if let Some(record) = self.sessions.lock().get_mut(&session_id) {
            record.state = new_state;
        }
    }
}

/// In-memory implementation of Gateway
///
/// This is primarily for testing. Cloning is cheap and clones share state, so
/// a test can hand one clone to the code under test and inspect another.
///
/// Statements containing `pg_sleep(N)` take `N` seconds of (tokio) time, which
/// keeps slow queries observable under a paused test clock.
///
/// # Example
///
/// ```
/// use pgload::gateway::InMemoryGateway;
///
/// let gateway = InMemoryGateway::new();
/// assert_eq!(gateway.open_sessions(), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    inner: Arc<Inner>,
}

impl InMemoryGateway {
    /// Create a new in-memory gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections whose label starts with `prefix`
    pub fn fail_connections_labeled(&self, prefix: impl Into<String>) {
        self.inner.failing_labels.lock().push(prefix.into());
    }

    /// Fail every statement containing `pattern`
    pub fn fail_statements_containing(&self, pattern: impl Into<String>) {
        self.inner.failing_statements.lock().push(pattern.into());
    }

    /// Drop the connection of any session that runs a statement containing
    /// `pattern`; the statement fails and the session reports itself broken
    pub fn break_sessions_on_statement(&self, pattern: impl Into<String>) {
        self.inner.breaking_statements.lock().push(pattern.into());
    }

    /// Delay applied to every statement (on top of any `pg_sleep`)
    pub fn set_statement_delay(&self, delay: Duration) {
        *self.inner.statement_delay.lock() = delay;
    }

    /// Number of currently open sessions
    pub fn open_sessions(&self) -> usize {
        self.inner.sessions.lock().values().filter(|s| s.open).count()
    }

    /// Number of currently open sessions whose label starts with `prefix`
    pub fn open_sessions_labeled(&self, prefix: &str) -> usize {
        self.inner
            .sessions
            .lock()
            .values()
            .filter(|s| s.open && s.label.starts_with(prefix))
            .count()
    }

    /// Histogram over all open sessions
    pub fn histogram(&self) -> StateHistogram {
        let sessions = self.inner.sessions.lock();
        StateHistogram::from_counts(
            sessions
                .values()
                .filter(|s| s.open)
                .map(|s| (s.state, 1i64)),
        )
    }

    /// Total commits over sessions whose label starts with `prefix`
    pub fn commits_labeled(&self, prefix: &str) -> u32 {
        self.inner
            .sessions
            .lock()
            .values()
            .filter(|s| s.label.starts_with(prefix))
            .map(|s| s.commits)
            .sum()
    }

    /// Total rollbacks over sessions whose label starts with `prefix`
    pub fn rollbacks_labeled(&self, prefix: &str) -> u32 {
        self.inner
            .sessions
            .lock()
            .values()
            .filter(|s| s.label.starts_with(prefix))
            .map(|s| s.rollbacks)
            .sum()
    }

    /// Copy of the operation log
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.inner.events.lock().clone()
    }

    /// Current length of the operation log
    pub fn event_count(&self) -> usize {
        self.inner.events.lock().len()
    }

    /// Number of logged statements containing `pattern`
    pub fn statements_containing(&self, pattern: &str) -> usize {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|e| matches!(&e.operation, Operation::Execute(sql) if sql.contains(pattern)))
            .count()
    }
}

#[async_trait]
impl Gateway for InMemoryGateway {
    async fn connect(&self, label: &str) -> Result<Box<dyn Session>, GatewayError> {
        tokio::task::yield_now().await;

        let refused = self
            .inner
            .failing_labels
            .lock()
            .iter()
            .any(|prefix| label.starts_with(prefix.as_str()));
        if refused {
            return Err(GatewayError::Connect {
                label: label.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions.lock().insert(
            id,
            SessionRecord {
                label: label.to_string(),
                state: state::IDLE,
                open: true,
                commits: 0,
                rollbacks: 0,
            },
        );
        self.inner.record(id, label, Operation::Connect);

        Ok(Box::new(InMemorySession {
            id,
            label: label.to_string(),
            inner: Arc::clone(&self.inner),
            autocommit: true,
            in_transaction: false,
            aborted: false,
            broken: false,
            closed: false,
        }))
    }
}

struct InMemorySession {
    id: u64,
    label: String,
    inner: Arc<Inner>,
    autocommit: bool,
    in_transaction: bool,
    aborted: bool,
    broken: bool,
    closed: bool,
}

impl InMemorySession {
    fn resting_state(&self) -> &'static str {
        match (self.in_transaction, self.aborted) {
            (true, true) => state::IDLE_IN_TRANSACTION_ABORTED,
            (true, false) => state::IDLE_IN_TRANSACTION,
            (false, _) => state::IDLE,
        }
    }

    fn end_transaction(&mut self, committed: bool) {
        if self.in_transaction {
            if let Some(record) = self.inner.sessions.lock().get_mut(&self.id) {
                if committed && !self.aborted {
                    record.commits += 1;
                } else {
                    record.rollbacks += 1;
                }
            }
        }
        self.in_transaction = false;
        self.aborted = false;
        self.inner.set_state(self.id, state::IDLE);
    }
}

/// Parse the argument of the first `pg_sleep(...)` call, in seconds
fn pg_sleep_seconds(sql: &str) -> Option<f64> {
    let start = sql.find("pg_sleep(")? + "pg_sleep(".len();
    let end = start + sql[start..].find(')')?;
    sql[start..end].trim().parse().ok()
}

#[async_trait]
impl Session for InMemorySession {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_broken(&self) -> bool {
        self.closed || self.broken
    }

    fn set_autocommit(&mut self, enabled: bool) {
        self.autocommit = enabled;
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, GatewayError> {
        self.inner
            .record(self.id, &self.label, Operation::Execute(sql.to_string()));

        if self.broken {
            return Err(GatewayError::Closed);
        }
        let breaks = self
            .inner
            .breaking_statements
            .lock()
            .iter()
            .any(|pattern| sql.contains(pattern.as_str()));
        if breaks {
            self.broken = true;
            // The server ends the backend; an open transaction goes with it.
            if let Some(record) = self.inner.sessions.lock().get_mut(&self.id) {
                if self.in_transaction {
                    record.rollbacks += 1;
                }
                record.open = false;
            }
            self.in_transaction = false;
            self.aborted = false;
            return Err(GatewayError::Closed);
        }
        if self.aborted {
            return Err(GatewayError::Statement(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .to_string(),
            ));
        }
        if !self.autocommit {
            self.in_transaction = true;
        }

        self.inner.set_state(self.id, state::ACTIVE);
        let mut delay = *self.inner.statement_delay.lock();
        if let Some(seconds) = pg_sleep_seconds(sql) {
            delay += Duration::from_secs_f64(seconds.max(0.0));
        }
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .inner
            .failing_statements
            .lock()
            .iter()
            .any(|pattern| sql.contains(pattern.as_str()));
        if failed && self.in_transaction {
            self.aborted = true;
        }
        self.inner.set_state(self.id, self.resting_state());

        if failed {
            Err(GatewayError::Statement(format!("injected failure: {sql}")))
        } else {
            Ok(1)
        }
    }

    async fn commit(&mut self) -> Result<(), GatewayError> {
        self.inner.record(self.id, &self.label, Operation::Commit);
        let aborted = self.aborted;
        self.end_transaction(true);
        if aborted {
            // PostgreSQL turns COMMIT of an aborted transaction into a rollback.
            return Err(GatewayError::Statement("transaction was aborted".to_string()));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), GatewayError> {
        self.inner.record(self.id, &self.label, Operation::Rollback);
        self.end_transaction(false);
        Ok(())
    }

    async fn session_states(&mut self) -> Result<StateHistogram, GatewayError> {
        self.inner
            .record(self.id, &self.label, Operation::SessionStates);
        let sessions = self.inner.sessions.lock();
        Ok(StateHistogram::from_counts(
            sessions
                .iter()
                .filter(|(id, s)| s.open && **id != self.id)
                .map(|(_, s)| (s.state, 1i64)),
        ))
    }

    async fn close(self: Box<Self>) -> Result<(), GatewayError> {
        let mut this = self;
        this.closed = true;
        this.inner.record(this.id, &this.label, Operation::Close);
        if let Some(record) = this.inner.sessions.lock().get_mut(&this.id) {
            record.open = false;
        }
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Server side, a vanished client rolls back whatever was open.
        if let Some(record) = self.inner.sessions.lock().get_mut(&self.id) {
            if self.in_transaction {
                record.rollbacks += 1;
            }
            record.open = false;
        }
        self.inner
            .record(self.id, &self.label, Operation::Disconnect);
    }
}
