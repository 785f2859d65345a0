//! Task supervision with a bounded join
//!
//! The supervisor never aborts a task. At shutdown it waits until a shared
//! deadline and then detaches whatever is still running.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Population a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    IdleHolder,
    IdleInTransaction,
    ActiveWorker,
    Reporter,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::IdleHolder => "idle",
            TaskKind::IdleInTransaction => "idle_in_tx",
            TaskKind::ActiveWorker => "active",
            TaskKind::Reporter => "reporter",
        };
        f.write_str(name)
    }
}

/// A spawned task and its identity
pub struct SupervisedTask {
    pub name: String,
    pub kind: TaskKind,
    handle: JoinHandle<()>,
}

/// Outcome of [`Supervisor::join_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinReport {
    /// Tasks that returned normally
    pub finished: usize,
    /// Names of tasks that panicked
    pub panicked: Vec<String>,
    /// Names of tasks still running at the deadline
    pub abandoned: Vec<String>,
}

impl JoinReport {
    /// Whether every task finished cleanly
    pub fn is_clean(&self) -> bool {
        self.panicked.is_empty() && self.abandoned.is_empty()
    }
}

/// Owns the handles of every load task
#[derive(Default)]
pub struct Supervisor {
    tasks: Vec<SupervisedTask>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` onto the runtime and track it
    pub fn spawn<F>(&mut self, kind: TaskKind, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, %kind, "Spawning task");
        self.tasks.push(SupervisedTask {
            name,
            kind,
            handle: tokio::spawn(future),
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tracked tasks of `kind`
    pub fn count(&self, kind: TaskKind) -> usize {
        self.tasks.iter().filter(|t| t.kind == kind).count()
    }

    /// Join every task against one deadline `timeout` from now
    ///
    /// Tasks still running at the deadline are detached, not aborted.
    pub async fn join_all(self, timeout: Duration) -> JoinReport {
        let deadline = Instant::now() + timeout;
        let mut report = JoinReport::default();

        for task in self.tasks {
            let SupervisedTask { name, kind, handle } = task;
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => report.finished += 1,
                Ok(Err(e)) => {
                    warn!(task = %name, %kind, error = %e, "Task panicked");
                    report.panicked.push(name);
                }
                Err(_) => {
                    debug!(task = %name, %kind, "Task still running at join deadline");
                    report.abandoned.push(name);
                }
            }
        }

        if !report.abandoned.is_empty() {
            warn!(
                abandoned = report.abandoned.len(),
                "Some tasks did not stop before the join deadline"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;

    #[test]
    fn test_task_kind_display() {
        assert_eq!(TaskKind::IdleInTransaction.to_string(), "idle_in_tx");
        assert_eq!(TaskKind::Reporter.to_string(), "reporter");
    }

    #[tokio::test]
    async fn test_join_all_collects_finished_tasks() {
        let shutdown = Shutdown::new();
        let mut supervisor = Supervisor::new();
        for i in 0..3 {
            let listener = shutdown.listener();
            supervisor.spawn(TaskKind::IdleHolder, format!("idle-{i}"), async move {
                listener.wait().await;
            });
        }
        assert_eq!(supervisor.count(TaskKind::IdleHolder), 3);

        shutdown.trigger();
        let report = supervisor.join_all(Duration::from_secs(1)).await;
        assert_eq!(report.finished, 3);
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_all_uses_one_shared_deadline() {
        let mut supervisor = Supervisor::new();
        for i in 0..4 {
            supervisor.spawn(TaskKind::ActiveWorker, format!("stuck-{i}"), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }

        let started = Instant::now();
        let report = supervisor.join_all(Duration::from_secs(3)).await;

        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(report.finished, 0);
        assert_eq!(report.abandoned.len(), 4);
    }

    #[tokio::test]
    async fn test_join_all_reports_panics() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn(TaskKind::Reporter, "reporter", async {
            panic!("boom");
        });
        supervisor.spawn(TaskKind::Reporter, "quiet", async {});

        let report = supervisor.join_all(Duration::from_secs(1)).await;
        assert_eq!(report.finished, 1);
        assert_eq!(report.panicked, vec!["reporter".to_string()]);
    }
}
