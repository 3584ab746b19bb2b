//! Connection manager.
//!
//! Resolves connection names to live handles, lazily and at most once per name.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per connection name**: single-flight creation; concurrent first
//!   callers wait for the one creation in flight
//! - **Resolve before insert**: unknown names never get a cell, so nothing is cached
//!   for them
//! - **Failures are not cached**: a failed `get_or_try_init` leaves the cell empty
//!   and the next call tries again
//! - **Independent backends**: resolving one name never touches another
//!
//! # Concurrency Safety
//!
//! - The name map is only write-locked to insert a missing cell; the steady-state
//!   path takes a read lock and clones an `Arc`
//! - No lock is held across connection creation; the cell serializes it
//! - The manager is cheap to clone and every clone shares the same handles
//! - A creation that overlaps `close_all` closes its handle and fails instead of
//!   leaving an untracked pool behind

use crate::config::{EnvVars, QueryLogConfig};
use crate::db::executor::{self, ExecOptions, Target};
use crate::db::factory::{ConnectionFactory, SqlxConnectionFactory};
use crate::db::instrumentation::{ProcessMemory, QueryLogger};
use crate::db::pool::ConnectionHandle;
use crate::db::registry::BackendRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionReport, HealthResult, ManagerStats};
use futures_util::future::join_all;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

type HandleCell = Arc<OnceCell<Arc<ConnectionHandle>>>;

/// Owns the registry, the factory and every live connection handle.
#[derive(Clone)]
pub struct ConnectionManager {
    registry: Arc<BackendRegistry>,
    factory: Arc<dyn ConnectionFactory>,
    logger: Arc<QueryLogger>,
    handles: Arc<RwLock<HashMap<String, HandleCell>>>,
    /// Bumped by `close_all`, under the map's write lock
    generation: Arc<AtomicU64>,
    initialized: Arc<AtomicBool>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("default", &self.registry.default_name())
            .field("configured", &self.registry.len())
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        registry: BackendRegistry,
        factory: Arc<dyn ConnectionFactory>,
        logger: QueryLogger,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            factory,
            logger: Arc::new(logger),
            handles: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Manager creating sqlx pools and logging through `tracing`.
    pub fn with_sqlx(registry: BackendRegistry, log_config: QueryLogConfig) -> Self {
        Self::new(
            registry,
            Arc::new(SqlxConnectionFactory::new()),
            QueryLogger::tracing(log_config),
        )
    }

    /// Build from the process environment.
    pub fn from_env() -> DbResult<Self> {
        Self::from_vars(&EnvVars::from_process())
    }

    /// Build from an environment snapshot.
    pub fn from_vars(env: &EnvVars) -> DbResult<Self> {
        let log_config =
            QueryLogConfig::from_env(env).map_err(|e| DbError::config("query_log", e))?;
        Ok(Self::with_sqlx(BackendRegistry::from_vars(env), log_config))
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn logger(&self) -> &QueryLogger {
        &self.logger
    }

    pub(crate) fn logger_arc(&self) -> &Arc<QueryLogger> {
        &self.logger
    }

    /// Name used when a call does not specify a connection.
    pub fn default_connection(&self) -> &str {
        self.registry.default_name()
    }

    /// Every configured name, valid or not, in declaration order.
    pub fn configured_connections(&self) -> Vec<String> {
        self.registry.names().map(str::to_string).collect()
    }

    /// Names with a live handle, in declaration order.
    pub async fn active_connections(&self) -> Vec<String> {
        let handles = self.handles.read().await;
        self.registry
            .names()
            .filter(|name| handles.get(*name).is_some_and(|cell| cell.initialized()))
            .map(str::to_string)
            .collect()
    }

    /// Get the handle for `name` (the default connection when `None`), creating it
    /// on first use.
    pub async fn connection(&self, name: Option<&str>) -> DbResult<Arc<ConnectionHandle>> {
        let name = name.unwrap_or(self.registry.default_name());

        // Steady state: handle already created
        let (cell, generation) = {
            let handles = self.handles.read().await;
            (
                handles.get(name).map(Arc::clone),
                self.generation.load(Ordering::Acquire),
            )
        };
        if let Some(handle) = cell.as_ref().and_then(|cell| cell.get()) {
            return Ok(Arc::clone(handle));
        }

        let config = self.registry.resolve(name)?;

        let (cell, generation) = match cell {
            Some(cell) => (cell, generation),
            None => {
                let mut handles = self.handles.write().await;
                // Double-check after acquiring write lock
                let cell = Arc::clone(
                    handles
                        .entry(name.to_string())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                );
                (cell, self.generation.load(Ordering::Acquire))
            }
        };

        let handle = cell
            .get_or_try_init(|| async {
                debug!(connection = %name, "Creating connection");
                let handle = self.factory.create(Arc::clone(&config)).await?;
                Ok::<_, DbError>(Arc::new(handle))
            })
            .await
            .inspect_err(|e| warn!(connection = %name, error = %e, "Connection failed"))?;

        // close_all drained this cell while it was initializing; nothing tracks it
        if self.generation.load(Ordering::Acquire) != generation {
            warn!(connection = %name, "Manager closed while connecting, closing new handle");
            handle.close().await;
            return Err(DbError::connection(
                format!("Connection '{name}' was closed while it was being created"),
                "Retry the call; the manager creates a fresh connection",
            ));
        }

        self.initialized.store(true, Ordering::Release);
        Ok(Arc::clone(handle))
    }

    /// Probe `name` with `SELECT 1`. Never fails; errors are reported in the result.
    pub async fn test_connection(&self, name: &str) -> HealthResult {
        let config = match self.registry.resolve(name) {
            Ok(config) => config,
            Err(e) => return HealthResult::failure(name, e.to_string()),
        };
        let budget = Duration::from_secs(config.connect_timeout_secs + config.query_timeout_secs);
        let started = Instant::now();

        let probe = async {
            let handle = self.connection(Some(name)).await?;
            let opts = ExecOptions::for_backend(handle.config());
            executor::fetch_rows(Target::Pool(handle.pool()), "SELECT 1", &[], &opts).await?;
            Ok::<_, DbError>(handle)
        };

        match timeout(budget, probe).await {
            Ok(Ok(handle)) => {
                handle.mark_health_check();
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                HealthResult::success(name, (elapsed_ms * 100.0).round() / 100.0)
            }
            Ok(Err(e)) => HealthResult::failure(name, e.to_string()),
            Err(_) => HealthResult::failure(
                name,
                format!("Health check timed out after {}s", budget.as_secs()),
            ),
        }
    }

    /// Status of every configured connection, attempting each independently.
    pub async fn connections_info(&self) -> IndexMap<String, ConnectionReport> {
        let names: Vec<&str> = self.registry.names().collect();
        let reports = join_all(names.iter().map(|name| self.report(name))).await;
        names
            .into_iter()
            .map(str::to_string)
            .zip(reports)
            .collect()
    }

    async fn report(&self, name: &str) -> ConnectionReport {
        if let Some(invalid) = self.registry.invalid(name) {
            return ConnectionReport::error(
                name,
                invalid.driver.trim().to_ascii_lowercase(),
                "N/A",
                "N/A",
                invalid.message.clone(),
            );
        }
        let config = match self.registry.resolve(name) {
            Ok(config) => config,
            Err(e) => return ConnectionReport::error(name, "unknown", "N/A", "N/A", e.to_string()),
        };

        match self.connection(Some(name)).await {
            Ok(handle) => ConnectionReport::connected(
                name,
                handle.driver(),
                config.display_host(),
                config.database.clone(),
                handle.server_version().map(str::to_string),
            ),
            Err(e) => ConnectionReport::error(
                name,
                config.driver.as_str(),
                config.display_host(),
                config.database.clone(),
                e.to_string(),
            ),
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        let memory = ProcessMemory::current();
        ManagerStats::new(
            self.initialized.load(Ordering::Acquire),
            self.active_connections().await.len(),
            memory.resident,
            memory.peak_resident,
            self.logger.dropped_entries(),
        )
    }

    /// Close every live handle. Later calls create fresh connections.
    pub async fn close_all(&self) {
        // Drain under lock, close outside lock. Creations still in flight see the
        // new generation and close their own handle.
        let cells: Vec<_> = {
            let mut handles = self.handles.write().await;
            self.generation.fetch_add(1, Ordering::AcqRel);
            handles.drain().collect()
        };

        for (name, cell) in cells {
            if let Some(handle) = cell.get() {
                info!(connection = %name, "Closing connection");
                handle.close().await;
            }
        }
        self.initialized.store(false, Ordering::Release);
    }
}
