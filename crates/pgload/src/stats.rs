//! Client-side query counters shared by the active workers and the reporter

use parking_lot::Mutex;
use serde::Serialize;

/// Counter values at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Iterations that committed
    pub queries: u64,
    /// Iterations that failed
    pub errors: u64,
}

impl StatsSnapshot {
    /// Completed iterations of any outcome
    pub fn total(&self) -> u64 {
        self.queries + self.errors
    }
}

/// Monotonic success / error counters behind one mutex
///
/// The lock is only held for an increment or a copy, never across I/O.
#[derive(Debug, Default)]
pub struct QueryStats {
    counters: Mutex<StatsSnapshot>,
}

impl QueryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.counters.lock().queries += 1;
    }

    pub fn record_error(&self) {
        self.counters.lock().errors += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.counters.lock()
    }
}
