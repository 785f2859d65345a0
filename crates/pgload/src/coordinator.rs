//! Load generator lifecycle
//!
//! [`LoadGenerator::run`] drives one complete run:
//!
//! 1. banner, scratch table setup, "before" histogram
//! 2. pool construction, task spawn, settle, "after" histogram, reporter
//! 3. wait for termination
//! 4. shutdown broadcast, bounded join, pool close, scratch teardown
//!
//! Everything after a successful scratch setup ends in teardown.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::LoadConfig;
use crate::gateway::{Gateway, GatewayError, StateHistogram};
use crate::pool::{ConnectionPool, PoolError, PoolStatus};
use crate::reporter::{read_histogram, Reporter, StatusSink};
use crate::scratch;
use crate::shutdown::Shutdown;
use crate::stats::{QueryStats, StatsSnapshot};
use crate::supervisor::{JoinReport, Supervisor, TaskKind};
use crate::worker::{self, idle_in_tx_label, idle_label, ActiveWorker};

/// Label of the before / after histogram sessions
pub const SNAPSHOT_LABEL: &str = "pgload-snapshot";

/// Errors that abort a run
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("scratch table setup failed: {0}")]
    Setup(#[source] GatewayError),

    #[error("connection pool could not be created: {0}")]
    Pool(#[from] PoolError),
}

/// What a finished run leaves behind
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Final client counters
    pub stats: StatsSnapshot,
    /// How the task join went
    pub tasks: JoinReport,
    /// Pool counters after `close_all`
    pub pool: PoolStatus,
    /// Histogram read before any load task started
    pub before: Option<StateHistogram>,
    /// Histogram read after settling; `None` if it failed or was skipped
    pub after: Option<StateHistogram>,
}

/// Runs the idle, idle-in-transaction and active populations against one
/// database
pub struct LoadGenerator {
    gateway: Arc<dyn Gateway>,
    config: LoadConfig,
    stats: Arc<QueryStats>,
    shutdown: Shutdown,
    status_sink: Option<StatusSink>,
}

impl LoadGenerator {
    pub fn new(gateway: Arc<dyn Gateway>, config: LoadConfig) -> Self {
        Self {
            gateway,
            config,
            stats: Arc::new(QueryStats::new()),
            shutdown: Shutdown::new(),
            status_sink: None,
        }
    }

    /// Send the status line somewhere other than stderr
    pub fn with_status_sink(mut self, sink: StatusSink) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Counters shared with the active workers
    pub fn stats(&self) -> Arc<QueryStats> {
        Arc::clone(&self.stats)
    }

    /// Handle that stops the run when triggered
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Run until `termination` completes or the shutdown handle fires
    pub async fn run<F>(mut self, termination: F) -> Result<RunSummary, LoadError>
    where
        F: Future<Output = ()>,
    {
        eprintln!("{}", self.config.banner());

        scratch::setup(self.gateway.as_ref())
            .await
            .map_err(LoadError::Setup)?;
        let before = snapshot(self.gateway.as_ref(), "before").await;

        let pool =
            match ConnectionPool::connect(Arc::clone(&self.gateway), self.config.pool.clone()).await
            {
                Ok(pool) => pool,
                Err(e) => {
                    teardown(self.gateway.as_ref()).await;
                    return Err(LoadError::Pool(e));
                }
            };

        let mut supervisor = if self.shutdown.is_triggered() {
            info!("Shutdown requested during startup");
            Supervisor::new()
        } else {
            let supervisor = self.spawn_load(&pool);
            info!(
                tasks = supervisor.len(),
                connections = self.config.total_connections(),
                "Load running"
            );
            supervisor
        };

        let listener = self.shutdown.listener();
        let termination = async move {
            tokio::select! {
                _ = termination => {}
                _ = listener.wait() => {}
            }
        };
        tokio::pin!(termination);

        let settle_delay = self.config.settle_delay;
        let gateway = Arc::clone(&self.gateway);
        let settle = async move {
            tokio::time::sleep(settle_delay).await;
            snapshot(gateway.as_ref(), "after").await
        };
        let settled = tokio::select! {
            biased;
            _ = &mut termination => None,
            after = settle => Some(after),
        };

        let after = match settled {
            Some(after) => {
                self.spawn_reporter(&mut supervisor);
                termination.await;
                after
            }
            None => {
                info!("Termination requested while settling");
                None
            }
        };

        self.shutdown.trigger();
        info!("Stopping load tasks");
        let tasks = supervisor.join_all(self.config.join_timeout).await;

        pool.close_all().await;
        teardown(self.gateway.as_ref()).await;

        let summary = RunSummary {
            stats: self.stats.snapshot(),
            tasks,
            pool: pool.status(),
            before,
            after,
        };
        info!(
            queries = summary.stats.queries,
            errors = summary.stats.errors,
            abandoned = summary.tasks.abandoned.len(),
            "Load stopped"
        );
        eprintln!("\n[pgload] done.");
        Ok(summary)
    }

    fn spawn_load(&self, pool: &ConnectionPool) -> Supervisor {
        let mut supervisor = Supervisor::new();

        for wid in 0..self.config.idle_conns {
            supervisor.spawn(
                TaskKind::IdleHolder,
                idle_label(wid),
                worker::idle::run(Arc::clone(&self.gateway), wid, self.shutdown.listener()),
            );
        }

        for wid in 0..self.config.idle_in_tx {
            supervisor.spawn(
                TaskKind::IdleInTransaction,
                idle_in_tx_label(wid),
                worker::idle_in_tx::run(Arc::clone(&self.gateway), wid, self.shutdown.listener()),
            );
        }

        for wid in 0..self.config.active_workers {
            let active = ActiveWorker::new(
                wid,
                pool.clone(),
                Arc::clone(&self.stats),
                self.config.slow_every,
                self.shutdown.listener(),
            );
            supervisor.spawn(TaskKind::ActiveWorker, active.name().to_string(), active.run());
        }

        supervisor
    }

    fn spawn_reporter(&mut self, supervisor: &mut Supervisor) {
        let mut reporter = Reporter::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.stats),
            self.config.report_interval,
            self.shutdown.listener(),
        );
        if let Some(sink) = self.status_sink.take() {
            reporter = reporter.with_sink(sink);
        }
        supervisor.spawn(TaskKind::Reporter, "reporter", reporter.run());
    }
}

async fn teardown(gateway: &dyn Gateway) {
    match scratch::teardown(gateway).await {
        Ok(()) => info!(table = scratch::SCRATCH_TABLE, "Scratch table dropped"),
        Err(e) => warn!(error = %e, "Scratch teardown failed"),
    }
}

/// Log the state histogram; failures are only diagnostic
async fn snapshot(gateway: &dyn Gateway, when: &str) -> Option<StateHistogram> {
    match read_histogram(gateway, SNAPSHOT_LABEL).await {
        Ok(histogram) => {
            info!(%histogram, "pg_stat_activity {when} load");
            Some(histogram)
        }
        Err(e) => {
            warn!(error = %e, "Could not read pg_stat_activity {when} load");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use crate::pool::{PoolConfig, POOL_LABEL};
    use std::time::Duration;

    fn small_config() -> LoadConfig {
        LoadConfig::new("postgres://localhost/test")
            .with_idle_conns(2)
            .with_idle_in_tx(1)
            .with_active_workers(2)
            .with_pool(PoolConfig::new(1, 2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_aborts_before_spawning() {
        let gateway = InMemoryGateway::new();
        gateway.fail_connections_labeled(scratch::SETUP_LABEL);

        let generator = LoadGenerator::new(Arc::new(gateway.clone()), small_config());
        let result = generator.run(std::future::pending()).await;

        assert!(matches!(result, Err(LoadError::Setup(_))));
        assert_eq!(gateway.event_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_failure_still_tears_down() {
        let gateway = InMemoryGateway::new();
        gateway.fail_connections_labeled(POOL_LABEL);

        let generator = LoadGenerator::new(Arc::new(gateway.clone()), small_config());
        let result = generator.run(std::future::pending()).await;

        assert!(matches!(result, Err(LoadError::Pool(PoolError::Connect(_)))));
        assert_eq!(gateway.statements_containing("DROP TABLE"), 1);
        assert_eq!(gateway.open_sessions_labeled("pgload-idle"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_setup_skips_load_and_tears_down() {
        let gateway = InMemoryGateway::new();
        gateway.set_statement_delay(Duration::from_secs(2));
        let generator = LoadGenerator::new(Arc::new(gateway.clone()), small_config())
            .with_status_sink(Box::new(std::io::sink()));
        let stop = generator.shutdown_handle();

        let run = tokio::spawn(generator.run(std::future::pending()));
        // Setup runs three delayed statements; stop in the middle of them.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(gateway.statements_containing("DROP TABLE"), 0);
        stop.trigger();

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.tasks.finished, 0, "{:?}", summary.tasks);
        assert!(summary.after.is_none());
        assert!(summary.pool.closed);
        assert_eq!(gateway.statements_containing("DROP TABLE"), 1);
        assert_eq!(gateway.open_sessions(), 0);
        assert!(gateway
            .events()
            .iter()
            .all(|e| !e.label.starts_with("pgload-idle") && !e.label.starts_with("pgload-itx")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_handle_ends_the_run() {
        let gateway = InMemoryGateway::new();
        let generator = LoadGenerator::new(Arc::new(gateway.clone()), small_config())
            .with_status_sink(Box::new(std::io::sink()));
        let stop = generator.shutdown_handle();

        let run = tokio::spawn(generator.run(std::future::pending()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.trigger();

        let summary = run.await.unwrap().unwrap();
        assert!(summary.tasks.is_clean(), "{:?}", summary.tasks);
        assert_eq!(summary.tasks.finished, 6);
        assert!(summary.before.is_some());
        assert!(summary.after.is_some());
        assert!(summary.pool.closed);
        assert_eq!(gateway.open_sessions(), 0);
    }
}
