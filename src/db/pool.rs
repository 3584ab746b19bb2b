//! Live connection handles.
//!
//! A [`ConnectionHandle`] wraps one database-specific pool (MySqlPool, PgPool,
//! SqlitePool) together with the configuration it was built from. Handles are
//! created by a [`ConnectionFactory`](crate::db::ConnectionFactory) and owned by
//! the [`ConnectionManager`](crate::db::ConnectionManager).

use crate::db::transaction::DbTransaction;
use crate::error::{DbError, DbResult};
use crate::models::{BackendConfig, DriverKind};
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            DbPool::MySql(pool) => pool.is_closed(),
            DbPool::Postgres(pool) => pool.is_closed(),
            DbPool::SQLite(pool) => pool.is_closed(),
        }
    }

    /// Number of connections currently held by the pool.
    pub fn size(&self) -> u32 {
        match self {
            DbPool::MySql(pool) => pool.size(),
            DbPool::Postgres(pool) => pool.size(),
            DbPool::SQLite(pool) => pool.size(),
        }
    }

    /// Begin a transaction on a dedicated pooled connection.
    pub async fn begin(&self) -> DbResult<DbTransaction> {
        let tx = match self {
            DbPool::MySql(pool) => DbTransaction::MySql(pool.begin().await?),
            DbPool::Postgres(pool) => DbTransaction::Postgres(pool.begin().await?),
            DbPool::SQLite(pool) => DbTransaction::SQLite(pool.begin().await?),
        };
        Ok(tx)
    }

    /// Get the server version from the connected database.
    pub async fn server_version(&self) -> Option<String> {
        let result = match self {
            DbPool::MySql(pool) => {
                sqlx::query_scalar::<_, String>("SELECT version()")
                    .fetch_one(pool)
                    .await
            }
            DbPool::Postgres(pool) => {
                sqlx::query_scalar::<_, String>("SELECT version()")
                    .fetch_one(pool)
                    .await
            }
            DbPool::SQLite(pool) => {
                sqlx::query_scalar::<_, String>("SELECT sqlite_version()")
                    .fetch_one(pool)
                    .await
            }
        };

        match result {
            Ok(version) => {
                debug!(version = %version, "Got server version");
                Some(version)
            }
            Err(e) => {
                warn!(error = %e, "Failed to get server version");
                None
            }
        }
    }
}

/// One live, pooled connection to a configured backend.
#[derive(Debug)]
pub struct ConnectionHandle {
    config: Arc<BackendConfig>,
    pool: DbPool,
    server_version: Option<String>,
    connected_at: DateTime<Utc>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    transaction_depth: AtomicU32,
}

impl ConnectionHandle {
    pub fn new(config: Arc<BackendConfig>, pool: DbPool, server_version: Option<String>) -> Self {
        Self {
            config,
            pool,
            server_version,
            connected_at: Utc::now(),
            last_health_check: RwLock::new(None),
            transaction_depth: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn driver(&self) -> DriverKind {
        self.config.driver
    }

    pub fn config(&self) -> &Arc<BackendConfig> {
        &self.config
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time of the last successful health probe.
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.last_health_check
            .read()
            .map(|guard| *guard)
            .unwrap_or(None)
    }

    pub(crate) fn mark_health_check(&self) {
        if let Ok(mut last) = self.last_health_check.write() {
            *last = Some(Utc::now());
        }
    }

    /// Number of manager transactions currently open on this handle.
    pub fn transaction_depth(&self) -> u32 {
        self.transaction_depth.load(Ordering::Acquire)
    }

    /// Count an open transaction until the returned guard is dropped.
    pub(crate) fn enter_transaction(self: &Arc<Self>) -> TransactionDepthGuard {
        self.transaction_depth.fetch_add(1, Ordering::AcqRel);
        TransactionDepthGuard {
            handle: Arc::clone(self),
        }
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Decrements the handle's transaction depth on drop, including on panic or
/// cancellation of the transaction future.
#[derive(Debug)]
pub(crate) struct TransactionDepthGuard {
    handle: Arc<ConnectionHandle>,
}

impl Drop for TransactionDepthGuard {
    fn drop(&mut self) {
        // Saturate at 0
        let _ = self.handle.transaction_depth.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| Some(count.saturating_sub(1)),
        );
    }
}

/// Generate a helpful suggestion for connection errors.
pub(crate) fn connection_suggestion(driver: DriverKind, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!("Check that the {} server is running and accessible", driver);
    }

    if error_str.contains("authentication")
        || error_str.contains("password")
        || error_str.contains("access denied")
    {
        return "Verify the username and password for this backend".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    match driver {
        DriverKind::Postgres => "Verify DB_POSTGRES_HOST, DB_POSTGRES_PORT and credentials".to_string(),
        DriverKind::MySql => "Verify the host, port and credentials of the MySQL backend".to_string(),
        DriverKind::Sqlite => "Verify the file path exists and is writable".to_string(),
        DriverKind::InMemory => "In-memory databases need no external resources".to_string(),
    }
}

/// Wrap a driver error raised while establishing a connection.
pub(crate) fn connect_error(config: &BackendConfig, error: sqlx::Error) -> DbError {
    DbError::connection(
        format!("Failed to connect to '{}': {}", config.name, error),
        connection_suggestion(config.driver, &error),
    )
}
