//! Data models for the connection manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod backend;
pub mod diagnostics;
pub mod query;

// Re-export commonly used types
pub use backend::{
    BackendConfig, BackendConfigBuilder, Credentials, DriverKind, DriverOptions, MySqlOptions,
    PostgresOptions, SqliteOptions,
};
pub use diagnostics::{ConnectionReport, ConnectionStatus, HealthResult, ManagerStats};
pub use query::{QueryLogEntry, QueryOutcome, QueryParam, Row, StatementKind};
