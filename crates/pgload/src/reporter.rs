//! Periodic status line
//!
//! Every interval the reporter copies the client counters, reads the
//! server-side state histogram over a short-lived session and overwrites one
//! line on its sink.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::gateway::{Gateway, GatewayError, Session, StateHistogram};
use crate::shutdown::ShutdownListener;
use crate::stats::{QueryStats, StatsSnapshot};

/// Label of the reporter's sessions
pub const MONITOR_LABEL: &str = "pgload-mon";

/// Destination of the status line
pub type StatusSink = Box<dyn Write + Send>;

/// Read the state histogram over a fresh auto-commit session
///
/// The reading session is excluded from the counts and closed before
/// returning, also when the read fails.
pub async fn read_histogram(
    gateway: &dyn Gateway,
    label: &str,
) -> Result<StateHistogram, GatewayError> {
    let session = gateway.connect(label).await?;
    read_and_close(session).await
}

async fn read_and_close(mut session: Box<dyn Session>) -> Result<StateHistogram, GatewayError> {
    let label = session.label().to_string();
    session.set_autocommit(true);
    let result = session.session_states().await;
    if let Err(e) = session.close().await {
        trace!(%label, error = %e, "Error closing histogram session");
    }
    result
}

/// Render one status line
///
/// `None` marks a failed histogram read and renders as `?`.
pub fn render_status_line(
    elapsed: Duration,
    histogram: Option<&StateHistogram>,
    stats: StatsSnapshot,
) -> String {
    let counts = histogram.map_or_else(|| "?".to_string(), ToString::to_string);
    format!(
        "\r[{:4}s]  {}   queries={} errors={}   ",
        elapsed.as_secs(),
        counts,
        stats.queries,
        stats.errors
    )
}

/// Status line task
pub struct Reporter {
    gateway: Arc<dyn Gateway>,
    stats: Arc<QueryStats>,
    interval: Duration,
    shutdown: ShutdownListener,
    sink: StatusSink,
}

impl Reporter {
    /// Create a reporter writing to stderr
    pub fn new(
        gateway: Arc<dyn Gateway>,
        stats: Arc<QueryStats>,
        interval: Duration,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            gateway,
            stats,
            interval,
            shutdown,
            sink: Box::new(std::io::stderr()),
        }
    }

    /// Write status lines to `sink` instead of stderr
    pub fn with_sink(mut self, sink: StatusSink) -> Self {
        self.sink = sink;
        self
    }

    /// Report until shutdown
    ///
    /// Shutdown interrupts the wait and the connect. A read that has started
    /// runs to completion so its session is closed, not dropped.
    pub async fn run(mut self) {
        let start = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let stats = self.stats.snapshot();
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                result = self.gateway.connect(MONITOR_LABEL) => result,
            };
            let read = match connected {
                Ok(session) => read_and_close(session).await,
                Err(e) => Err(e),
            };
            if self.shutdown.is_shutdown() {
                break;
            }
            let histogram = match read {
                Ok(histogram) => Some(histogram),
                Err(e) => {
                    debug!(error = %e, "State histogram unavailable");
                    None
                }
            };

            let line = render_status_line(start.elapsed(), histogram.as_ref(), stats);
            // A closed terminal must not stop the load.
            let _ = self.sink.write_all(line.as_bytes());
            let _ = self.sink.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{state, InMemoryGateway, Operation};
    use crate::shutdown::Shutdown;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Gateway whose sessions fire shutdown in the middle of a state read
    struct StopMidRead {
        gateway: InMemoryGateway,
        shutdown: Shutdown,
    }

    struct StopMidReadSession {
        inner: Box<dyn Session>,
        shutdown: Shutdown,
    }

    #[async_trait]
    impl Gateway for StopMidRead {
        async fn connect(&self, label: &str) -> Result<Box<dyn Session>, GatewayError> {
            let inner = self.gateway.connect(label).await?;
            Ok(Box::new(StopMidReadSession {
                inner,
                shutdown: self.shutdown.clone(),
            }))
        }
    }

    #[async_trait]
    impl Session for StopMidReadSession {
        fn label(&self) -> &str {
            self.inner.label()
        }

        fn is_broken(&self) -> bool {
            self.inner.is_broken()
        }

        fn set_autocommit(&mut self, enabled: bool) {
            self.inner.set_autocommit(enabled);
        }

        async fn execute(&mut self, sql: &str) -> Result<u64, GatewayError> {
            self.inner.execute(sql).await
        }

        async fn commit(&mut self) -> Result<(), GatewayError> {
            self.inner.commit().await
        }

        async fn rollback(&mut self) -> Result<(), GatewayError> {
            self.inner.rollback().await
        }

        async fn session_states(&mut self) -> Result<StateHistogram, GatewayError> {
            self.shutdown.trigger();
            tokio::task::yield_now().await;
            self.inner.session_states().await
        }

        async fn close(self: Box<Self>) -> Result<(), GatewayError> {
            self.inner.close().await
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_render_status_line() {
        let histogram = StateHistogram::from_counts([("idle", 30), ("idle in transaction", 10)]);
        let stats = StatsSnapshot {
            queries: 42,
            errors: 1,
        };
        assert_eq!(
            render_status_line(Duration::from_secs(9), Some(&histogram), stats),
            "\r[   9s]  idle:30  idle in transaction:10   queries=42 errors=1   "
        );
        assert_eq!(
            render_status_line(Duration::from_millis(12_900), None, stats),
            "\r[  12s]  ?   queries=42 errors=1   "
        );
    }

    #[tokio::test]
    async fn test_read_histogram_closes_its_session() {
        let gateway = InMemoryGateway::new();
        let _held = gateway.connect("pgload-idle-00").await.unwrap();

        let histogram = read_histogram(&gateway, MONITOR_LABEL).await.unwrap();
        assert_eq!(histogram.count(state::IDLE), 1);
        assert_eq!(gateway.open_sessions_labeled(MONITOR_LABEL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_writes_lines_until_shutdown() {
        let gateway = InMemoryGateway::new();
        let stats = Arc::new(QueryStats::new());
        stats.record_success();
        let shutdown = Shutdown::new();
        let sink = Captured::default();

        let reporter = Reporter::new(
            Arc::new(gateway.clone()),
            Arc::clone(&stats),
            Duration::from_secs(3),
            shutdown.listener(),
        )
        .with_sink(Box::new(sink.clone()));
        let task = tokio::spawn(reporter.run());

        tokio::time::sleep(Duration::from_millis(6_500)).await;
        shutdown.trigger();
        task.await.unwrap();

        let text = sink.text();
        assert_eq!(text.matches('\r').count(), 2, "{text:?}");
        assert!(text.contains("[   3s]"));
        assert!(text.contains("[   6s]"));
        assert!(text.contains("queries=1 errors=0"));
        assert_eq!(gateway.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_read_still_closes_session() {
        let gateway = InMemoryGateway::new();
        let shutdown = Shutdown::new();
        let sink = Captured::default();
        let stopping = StopMidRead {
            gateway: gateway.clone(),
            shutdown: shutdown.clone(),
        };

        let reporter = Reporter::new(
            Arc::new(stopping),
            Arc::new(QueryStats::new()),
            Duration::from_secs(3),
            shutdown.listener(),
        )
        .with_sink(Box::new(sink.clone()));
        reporter.run().await;

        let operations: Vec<_> = gateway.events().into_iter().map(|e| e.operation).collect();
        assert_eq!(
            operations,
            vec![Operation::Connect, Operation::SessionStates, Operation::Close]
        );
        assert_eq!(gateway.open_sessions(), 0);
        assert!(sink.text().is_empty(), "no line after shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_renders_question_mark() {
        let gateway = InMemoryGateway::new();
        gateway.fail_connections_labeled(MONITOR_LABEL);
        let shutdown = Shutdown::new();
        let sink = Captured::default();

        let reporter = Reporter::new(
            Arc::new(gateway.clone()),
            Arc::new(QueryStats::new()),
            Duration::from_secs(3),
            shutdown.listener(),
        )
        .with_sink(Box::new(sink.clone()));
        let task = tokio::spawn(reporter.run());

        tokio::time::sleep(Duration::from_secs(4)).await;
        shutdown.trigger();
        task.await.unwrap();

        assert!(sink.text().contains("]  ?   queries=0"));
        assert!(!gateway
            .events()
            .iter()
            .any(|e| e.operation == Operation::Connect));
    }
}
