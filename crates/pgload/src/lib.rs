//! # pgload
//!
//! Synthetic connection load for exercising `pg_stat_activity` monitors.
//!
//! ## Populations
//!
//! - **Idle holders**: sessions that connect and never run a statement (`idle`)
//! - **Idle-in-transaction holders**: sessions that open a transaction and sit
//!   on it (`idle in transaction`)
//! - **Active workers**: tasks that borrow a pooled session, run a fast or an
//!   occasional slow query, commit and give it back (`active` / `idle`)
//!
//! A reporter prints the server-side state histogram next to the client
//! counters every few seconds.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LoadGenerator                           │
//! │  (setup, spawn, settle, wait for termination, teardown)     │
//! └─────────────────────────────────────────────────────────────┘
//!            │ Shutdown (watch)               │ Supervisor
//!            ▼                                ▼
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ ┌──────────┐
//! │ idle holders │ │ idle-in-tx   │ │ active       │ │ reporter │
//! │              │ │ holders      │ │ workers      │ │          │
//! └──────────────┘ └──────────────┘ └──────────────┘ └──────────┘
//!            │                │              │              │
//!            │                │              ▼              │
//!            │                │   ┌────────────────────┐    │
//!            │                │   │  ConnectionPool    │    │
//!            │                │   │  (min..max slots)  │    │
//!            │                │   └────────────────────┘    │
//!            ▼                ▼              ▼              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Gateway / Session                          │
//! │  (PostgresGateway over sqlx, InMemoryGateway for tests)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pgload::prelude::*;
//!
//! let gateway = Arc::new(PostgresGateway::new(DEFAULT_DSN)?);
//! let generator = LoadGenerator::new(gateway, LoadConfig::new(DEFAULT_DSN));
//! let stop = generator.shutdown_handle();
//! let signals = SignalWatcher::install()?;
//! tokio::spawn(async move {
//!     let _ = signals.recv().await;
//!     stop.trigger();
//! });
//! let summary = generator.run(std::future::pending()).await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod pool;
pub mod queries;
pub mod reporter;
pub mod scratch;
pub mod shutdown;
pub mod stats;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{LoadConfig, DEFAULT_DSN, DSN_ENV};
    pub use crate::coordinator::{LoadError, LoadGenerator, RunSummary};
    pub use crate::gateway::{
        Gateway, GatewayError, InMemoryGateway, PostgresGateway, Session, StateHistogram,
    };
    pub use crate::pool::{ConnectionPool, PoolConfig, PoolError, PoolStatus};
    pub use crate::shutdown::{wait_for_signal, Shutdown, ShutdownListener, SignalWatcher};
    pub use crate::stats::{QueryStats, StatsSnapshot};
}

pub use config::LoadConfig;
pub use coordinator::{LoadError, LoadGenerator, RunSummary};
