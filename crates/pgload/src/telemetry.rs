//! Logging setup
//!
//! Log lines go to stderr next to the status line, so the filter defaults to
//! `pgload=info` and per-statement detail stays at `debug`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor `LOG_LEVEL` is set
pub const DEFAULT_LOG_FILTER: &str = "pgload=info";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive (e.g. "info", "pgload=debug")
    pub log_filter: Option<String>,
    /// Print the event target next to each line
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Read `RUST_LOG`, then `LOG_LEVEL`
    ///
    /// A bare level in `LOG_LEVEL` is scoped to this crate.
    pub fn from_env() -> Self {
        let log_filter = std::env::var("RUST_LOG").ok().or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| format!("pgload={level}"))
        });
        Self {
            log_filter,
            ..Default::default()
        }
    }

    /// Build the filter, falling back to the default on a bad directive
    pub fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_deref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Install the global subscriber; call once at startup
pub fn init_logging(config: LogConfig) {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.with_target)
        .with_filter(config.filter());

    tracing_subscriber::registry().with(console_layer).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        let config = LogConfig::default();
        assert_eq!(config.filter().to_string(), DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_explicit_filter() {
        let config = LogConfig {
            log_filter: Some("pgload=debug".to_string()),
            ..Default::default()
        };
        assert_eq!(config.filter().to_string(), "pgload=debug");
    }

    #[test]
    fn test_invalid_filter_falls_back() {
        let config = LogConfig {
            log_filter: Some("pgload=notalevel".to_string()),
            ..Default::default()
        };
        assert_eq!(config.filter().to_string(), DEFAULT_LOG_FILTER);
    }
}
