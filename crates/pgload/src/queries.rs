//! Statement catalog and slow-query cadence for the active workers

use std::ops::{Range, RangeInclusive};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;

/// Cheap statements; result sets are drained
pub const FAST_QUERIES: &[&str] = &[
    "SELECT count(*) FROM pgload_scratch",
    "SELECT avg(val), max(val) FROM pgload_scratch",
    "SELECT * FROM pgload_scratch ORDER BY val DESC LIMIT 10",
    "SELECT count(*) FROM pg_stat_activity",
    "SELECT count(*) FROM pg_locks",
    "SELECT sum(xact_commit) FROM pg_stat_database",
    "UPDATE pgload_scratch SET val=random()*1000 \
     WHERE id=(SELECT id FROM pgload_scratch ORDER BY random() LIMIT 1)",
    "INSERT INTO pgload_scratch (val) VALUES (random()*1000)",
];

/// Long-running statements; `{s}` is replaced with a sleep in seconds
pub const SLOW_QUERIES: &[&str] = &[
    "SELECT pg_sleep({s})",
    "SELECT pg_sleep({s}), count(*) FROM pgload_scratch",
    "SELECT count(*) FROM pgload_scratch a, pgload_scratch b WHERE a.val+b.val > 999",
];

/// Bounds for the `pg_sleep` argument of slow queries, in seconds
pub const SLOW_SLEEP_SECS: RangeInclusive<f64> = 2.0..=5.0;

/// Bounds for the pause between worker iterations, in seconds
pub const PAUSE_SECS: Range<f64> = 0.4..1.5;

/// Issued by idle-in-transaction holders to open their transaction
pub const OPEN_TRANSACTION_SQL: &str = "SELECT pg_backend_pid()";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Fast,
    Slow,
}

/// A statement picked for one worker iteration
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub class: QueryClass,
    pub sql: String,
}

impl Statement {
    /// Pick a random fast statement
    pub fn fast() -> Self {
        let sql = FAST_QUERIES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(FAST_QUERIES[0]);
        Self {
            class: QueryClass::Fast,
            sql: sql.to_string(),
        }
    }

    /// Pick a random slow statement with a random sleep
    pub fn slow() -> Self {
        let mut rng = rand::thread_rng();
        let template = SLOW_QUERIES.choose(&mut rng).copied().unwrap_or(SLOW_QUERIES[0]);
        let seconds: f64 = rng.gen_range(SLOW_SLEEP_SECS);
        Self::slow_from(template, seconds)
    }

    /// Render a slow template; the sleep is rounded to a tenth of a second
    pub fn slow_from(template: &str, seconds: f64) -> Self {
        let seconds = (seconds * 10.0).round() / 10.0;
        Self {
            class: QueryClass::Slow,
            sql: template.replace("{s}", &format!("{seconds:.1}")),
        }
    }
}

/// Random pause between worker iterations
pub fn random_pause() -> Duration {
    Duration::from_secs_f64(rand::thread_rng().gen_range(PAUSE_SECS))
}

/// Per-worker slow query schedule
///
/// Each worker owns one; cadences are never coordinated across workers.
#[derive(Debug, Clone)]
pub struct SlowQueryClock {
    every: Duration,
    last: Instant,
}

impl SlowQueryClock {
    /// Start a clock whose first slow query is offset by a random
    /// `[0, every)` so workers spread out
    pub fn new(every: Duration) -> Self {
        let jitter = every.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        Self::starting_at(Instant::now() + jitter, every)
    }

    /// Start a clock as if the last slow query ran at `last`
    pub fn starting_at(last: Instant, every: Duration) -> Self {
        Self { every, last }
    }

    /// Whether a slow query is due at `now`; marks it as run if so
    pub fn poll_due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.every {
            self.last = now;
            true
        } else {
            false
        }
    }

    /// Pick the next statement
    pub fn next_statement(&mut self, now: Instant) -> Statement {
        if self.poll_due(now) {
            Statement::slow()
        } else {
            Statement::fast()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_from_rounds_sleep() {
        let statement = Statement::slow_from("SELECT pg_sleep({s})", 3.14159);
        assert_eq!(statement.sql, "SELECT pg_sleep(3.1)");
        assert_eq!(statement.class, QueryClass::Slow);

        let statement = Statement::slow_from(SLOW_QUERIES[2], 4.0);
        assert_eq!(statement.sql, SLOW_QUERIES[2]);
    }

    #[test]
    fn test_random_slow_statement_sleep_in_bounds() {
        for _ in 0..200 {
            let statement = Statement::slow();
            if let Some(start) = statement.sql.find("pg_sleep(") {
                let rest = &statement.sql[start + "pg_sleep(".len()..];
                let seconds: f64 = rest[..rest.find(')').unwrap()].parse().unwrap();
                assert!(SLOW_SLEEP_SECS.contains(&seconds), "sleep {seconds} out of range");
            }
        }
    }

    #[test]
    fn test_fast_statement_from_catalog() {
        let statement = Statement::fast();
        assert_eq!(statement.class, QueryClass::Fast);
        assert!(FAST_QUERIES.contains(&statement.sql.as_str()));
    }

    #[test]
    fn test_random_pause_in_bounds() {
        for _ in 0..200 {
            let pause = random_pause().as_secs_f64();
            assert!(PAUSE_SECS.contains(&pause));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_fires_every_interval() {
        let every = Duration::from_secs(12);
        let start = Instant::now();
        let mut clock = SlowQueryClock::starting_at(start, every);

        assert!(!clock.poll_due(start + Duration::from_secs(11)));
        assert!(clock.poll_due(start + Duration::from_secs(12)));
        assert!(!clock.poll_due(start + Duration::from_secs(20)));
        assert!(clock.poll_due(start + Duration::from_secs(24)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_with_future_start_is_not_due() {
        let every = Duration::from_secs(12);
        let now = Instant::now();
        let mut clock = SlowQueryClock::starting_at(now + Duration::from_secs(5), every);

        assert!(!clock.poll_due(now));
        assert!(!clock.poll_due(now + Duration::from_secs(16)));
        assert!(clock.poll_due(now + Duration::from_secs(17)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_clock_first_slow_query_within_two_intervals() {
        let every = Duration::from_secs(12);
        let now = Instant::now();
        let mut clock = SlowQueryClock::new(every);

        assert!(!clock.poll_due(now + Duration::from_secs(11)));
        assert!(clock.poll_due(now + Duration::from_secs(24)));
    }
}
