//! Connection factory.
//!
//! Turns one [`BackendConfig`] into one live [`ConnectionHandle`], applying the
//! driver-specific session options. The [`ConnectionFactory`] trait is the seam
//! the manager creates connections through, so tests can substitute their own.

use crate::db::pool::{ConnectionHandle, DbPool, connect_error};
use crate::error::{DbError, DbResult};
use crate::models::{BackendConfig, DriverKind, DriverOptions};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Executor;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Session `sql_mode` for strict MySQL backends.
pub const MYSQL_STRICT_SQL_MODE: &str = "ONLY_FULL_GROUP_BY,STRICT_TRANS_TABLES,NO_ZERO_IN_DATE,NO_ZERO_DATE,ERROR_FOR_DIVISION_BY_ZERO,NO_ENGINE_SUBSTITUTION";

/// Session `sql_mode` for non-strict MySQL backends.
pub const MYSQL_LOOSE_SQL_MODE: &str = "NO_ENGINE_SUBSTITUTION";

/// Server-side prepared statements kept per connection unless prepares are emulated.
const STATEMENT_CACHE_CAPACITY: usize = 100;

/// Creates live connection handles from backend records.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Establish a connection for `config`. Never retries.
    async fn create(&self, config: Arc<BackendConfig>) -> DbResult<ConnectionHandle>;
}

/// Factory backed by sqlx pools.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxConnectionFactory;

impl SqlxConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionFactory for SqlxConnectionFactory {
    async fn create(&self, config: Arc<BackendConfig>) -> DbResult<ConnectionHandle> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

        info!(
            connection = %config.name,
            driver = %config.driver,
            host = %config.display_host(),
            database = %config.database,
            "Connecting to database"
        );

        let pool = match timeout(connect_timeout, create_pool(&config)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DbError::connection(
                    format!(
                        "Timed out connecting to '{}' after {}s",
                        config.name, config.connect_timeout_secs
                    ),
                    "Check that the host is reachable or raise the connect timeout",
                ));
            }
        };

        let probe_timeout = Duration::from_secs(config.query_timeout_secs);
        let server_version = timeout(probe_timeout, pool.server_version())
            .await
            .unwrap_or(None);

        info!(
            connection = %config.name,
            server_version = ?server_version,
            "Connected successfully"
        );

        Ok(ConnectionHandle::new(config, pool, server_version))
    }
}

fn statement_cache_capacity(options: &DriverOptions) -> usize {
    if options.emulate_prepares() {
        0
    } else {
        STATEMENT_CACHE_CAPACITY
    }
}

/// Create a connection pool for the given configuration.
async fn create_pool(config: &BackendConfig) -> DbResult<DbPool> {
    let pool_opts = &config.pool;
    let acquire_timeout = Duration::from_secs(config.connect_timeout_secs);
    let idle_timeout = Some(Duration::from_secs(pool_opts.idle_timeout_or_default()));
    let cache_capacity = statement_cache_capacity(&config.driver_options);

    match config.driver {
        DriverKind::MySql => {
            let mut options = match &config.url {
                Some(url) => MySqlConnectOptions::from_str(url).map_err(|e| {
                    DbError::config(
                        config.name.as_str(),
                        format!("Invalid MySQL connection URL: {}", e),
                    )
                })?,
                None => {
                    let mut options = MySqlConnectOptions::new()
                        .host(config.host.as_deref().unwrap_or_default())
                        .database(&config.database)
                        .username(&config.credentials.username);
                    if let Some(port) = config.port {
                        options = options.port(port);
                    }
                    if let Some(password) = config.credentials.password() {
                        options = options.password(password);
                    }
                    options
                }
            };
            options = options
                .charset(config.charset.as_deref().unwrap_or("utf8mb4"))
                .statement_cache_capacity(cache_capacity);
            if let Some(collation) = &config.collation {
                options = options.collation(collation);
            }

            let sql_mode = if config.strict {
                MYSQL_STRICT_SQL_MODE
            } else {
                MYSQL_LOOSE_SQL_MODE
            };
            debug!(connection = %config.name, sql_mode = sql_mode, "Applying session sql_mode");

            let pool = MySqlPoolOptions::new()
                .min_connections(pool_opts.min_connections_or_default())
                .max_connections(pool_opts.max_connections_or_default(false))
                .acquire_timeout(acquire_timeout)
                .idle_timeout(idle_timeout)
                .test_before_acquire(pool_opts.test_before_acquire_or_default())
                .after_connect(move |conn, _meta| {
                    Box::pin(async move {
                        conn.execute(format!("SET SESSION sql_mode = '{}'", sql_mode).as_str())
                            .await?;
                        Ok(())
                    })
                })
                .connect_with(options)
                .await
                .map_err(|e| connect_error(config, e))?;
            Ok(DbPool::MySql(pool))
        }
        DriverKind::Postgres => {
            let mut options = match &config.url {
                Some(url) => PgConnectOptions::from_str(url).map_err(|e| {
                    DbError::config(
                        config.name.as_str(),
                        format!("Invalid PostgreSQL connection URL: {}", e),
                    )
                })?,
                None => {
                    let mut options = PgConnectOptions::new()
                        .host(config.host.as_deref().unwrap_or_default())
                        .database(&config.database)
                        .username(&config.credentials.username);
                    if let Some(port) = config.port {
                        options = options.port(port);
                    }
                    if let Some(password) = config.credentials.password() {
                        options = options.password(password);
                    }
                    options
                }
            };
            if let DriverOptions::Postgres(pg) = &config.driver_options {
                let ssl_mode = PgSslMode::from_str(&pg.ssl_mode).map_err(|e| {
                    DbError::config(
                        config.name.as_str(),
                        format!("Invalid sslmode '{}': {}", pg.ssl_mode, e),
                    )
                })?;
                options = options
                    .ssl_mode(ssl_mode)
                    .options([("search_path", pg.schema.as_str())]);
            }
            options = options.statement_cache_capacity(cache_capacity);

            let pool = PgPoolOptions::new()
                .min_connections(pool_opts.min_connections_or_default())
                .max_connections(pool_opts.max_connections_or_default(false))
                .acquire_timeout(acquire_timeout)
                .idle_timeout(idle_timeout)
                .test_before_acquire(pool_opts.test_before_acquire_or_default())
                .connect_with(options)
                .await
                .map_err(|e| connect_error(config, e))?;
            Ok(DbPool::Postgres(pool))
        }
        DriverKind::Sqlite | DriverKind::InMemory => {
            let foreign_keys = match &config.driver_options {
                DriverOptions::Sqlite(opts) => opts.foreign_keys,
                _ => true,
            };

            let (options, pool_options) = if config.driver == DriverKind::InMemory {
                // One connection that never idles out keeps the database alive.
                let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
                let pool_options = SqlitePoolOptions::new()
                    .min_connections(1)
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None);
                (options, pool_options)
            } else {
                let options = SqliteConnectOptions::new()
                    .filename(&config.database)
                    .create_if_missing(true);
                let pool_options = SqlitePoolOptions::new()
                    .min_connections(pool_opts.min_connections_or_default())
                    .max_connections(pool_opts.max_connections_or_default(true))
                    .idle_timeout(idle_timeout);
                (options, pool_options)
            };

            let options = options
                .foreign_keys(foreign_keys)
                .statement_cache_capacity(cache_capacity);

            let pool = pool_options
                .acquire_timeout(acquire_timeout)
                .test_before_acquire(pool_opts.test_before_acquire_or_default())
                .connect_with(options)
                .await
                .map_err(|e| connect_error(config, e))?;
            Ok(DbPool::SQLite(pool))
        }
    }
}
