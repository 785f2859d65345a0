//! Database gateway
//!
//! This module provides:
//! - [`Gateway`] / [`Session`] traits, the only way the load model talks to a database
//! - [`PostgresGateway`] for real PostgreSQL servers
//! - [`InMemoryGateway`] for testing

mod memory;
mod postgres;
mod session;

pub use memory::{GatewayEvent, InMemoryGateway, Operation};
pub use postgres::{PostgresGateway, SESSION_STATES_SQL};
pub use session::{state, Gateway, GatewayError, Session, StateHistogram};
