//! Database layer.
//!
//! This module provides:
//! - Backend configuration registry
//! - Connection factory and live connection handles
//! - The connection manager
//! - Statement classification, routing and execution
//! - Transactions with savepoints
//! - Query logging
//! - Type mappings

pub mod classify;
pub(crate) mod executor;
pub mod factory;
pub mod instrumentation;
pub mod manager;
pub(crate) mod params;
pub mod pool;
pub mod registry;
pub(crate) mod router;
pub mod transaction;
pub mod types;

pub use classify::classify;
pub use factory::{ConnectionFactory, SqlxConnectionFactory};
pub use instrumentation::{
    CollectingSink, ProcessMemory, QueryLogger, QuerySink, SinkError, TracingSink,
};
pub use manager::ConnectionManager;
pub use pool::{ConnectionHandle, DbPool};
pub use registry::{BackendRegistry, InvalidBackend, RegistryBuilder};
pub use transaction::{DbTransaction, TransactionScope};
