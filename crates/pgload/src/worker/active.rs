//! Active worker: borrow a pooled session, run one statement, give it back

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::gateway::{GatewayError, Session};
use crate::pool::{ConnectionPool, PoolError};
use crate::queries::{random_pause, QueryClass, SlowQueryClock, Statement};
use crate::shutdown::ShutdownListener;
use crate::stats::QueryStats;

/// Outcome of one worker iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// Statement and commit succeeded
    Committed,
    /// Checkout, statement or commit failed
    Failed,
    /// No pool slot was free
    Skipped,
    /// Shutdown arrived mid-iteration
    Interrupted,
}

/// One active worker
pub struct ActiveWorker {
    name: String,
    pool: ConnectionPool,
    stats: Arc<QueryStats>,
    clock: SlowQueryClock,
    shutdown: ShutdownListener,
}

impl ActiveWorker {
    pub fn new(
        wid: usize,
        pool: ConnectionPool,
        stats: Arc<QueryStats>,
        slow_every: Duration,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            name: format!("active-{wid:02}"),
            pool,
            stats,
            clock: SlowQueryClock::new(slow_every),
            shutdown,
        }
    }

    /// Replace the slow query schedule
    pub fn with_clock(mut self, clock: SlowQueryClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run iterations until shutdown
    pub async fn run(mut self) {
        debug!(worker = %self.name, "Active worker started");

        while !self.shutdown.is_shutdown() {
            match self.iterate().await {
                Iteration::Committed => self.stats.record_success(),
                Iteration::Failed => self.stats.record_error(),
                Iteration::Skipped => {}
                Iteration::Interrupted => break,
            }

            let pause = random_pause();
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        debug!(worker = %self.name, "Active worker stopped");
    }

    /// Run one acquire / execute / commit / release cycle
    ///
    /// Counters are left untouched; the caller records the outcome.
    pub async fn iterate(&mut self) -> Iteration {
        let acquired = tokio::select! {
            biased;
            _ = self.shutdown.wait() => None,
            result = self.pool.acquire() => Some(result),
        };
        let Some(acquired) = acquired else {
            return Iteration::Interrupted;
        };

        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(PoolError::Exhausted | PoolError::Closed) => return Iteration::Skipped,
            Err(e) => {
                warn!(worker = %self.name, error = %e, "Pool checkout failed");
                return Iteration::Failed;
            }
        };

        let statement = self.clock.next_statement(Instant::now());
        if statement.class == QueryClass::Slow {
            debug!(worker = %self.name, sql = %statement.sql, "Running slow query");
        }

        let outcome = {
            let shutdown = &self.shutdown;
            let work = run_statement(&mut *conn, &statement);
            tokio::select! {
                biased;
                _ = shutdown.wait() => None,
                result = work => Some(result),
            }
        };

        match outcome {
            None => {
                // The statement may still be running server side.
                conn.discard();
                Iteration::Interrupted
            }
            Some(Ok(())) => {
                self.pool.release(conn);
                Iteration::Committed
            }
            Some(Err(e)) => {
                debug!(worker = %self.name, error = %e, sql = %statement.sql, "Query failed");
                if let Err(e) = conn.rollback().await {
                    debug!(worker = %self.name, error = %e, "Rollback after failure failed");
                }
                self.pool.release(conn);
                Iteration::Failed
            }
        }
    }
}

async fn run_statement(session: &mut dyn Session, statement: &Statement) -> Result<(), GatewayError> {
    session.set_autocommit(false);
    session.execute(&statement.sql).await?;
    session.commit().await
}
