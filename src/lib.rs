//! Multi-backend database connection manager.
//!
//! Named MySQL, PostgreSQL and SQLite backends are configured up front and
//! connected lazily, once per name. Statements are routed by their leading
//! keyword, transactions run as closures with savepoint support, and every
//! statement is timed for the slow-query log.

pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod models;

pub use config::Config;
pub use db::{BackendRegistry, ConnectionManager, TransactionScope};
pub use error::{DbError, DbResult};
