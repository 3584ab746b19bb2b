//! Backend configuration registry.
//!
//! The registry maps connection names to [`BackendConfig`] records. It is pure data:
//! nothing here opens a connection. Records come either from the process environment
//! (with the defaults table below) or from [`RegistryBuilder`].
//!
//! A backend whose environment is broken is kept as an invalid entry instead of
//! failing the whole load, so the other backends stay usable.

use crate::config::{DEFAULT_CONNECTION, EnvVars, PoolOptions};
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendConfig, DriverKind, DriverOptions, MySqlOptions, PostgresOptions, SqliteOptions,
};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A backend that could not be built from its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidBackend {
    /// Driver as configured, possibly unsupported
    pub driver: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub(crate) enum RegistryEntry {
    Valid(Arc<BackendConfig>),
    Invalid(InvalidBackend),
}

/// Named backend records with one default.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    entries: IndexMap<String, RegistryEntry>,
    default: String,
}

impl BackendRegistry {
    /// Start building a registry programmatically.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Load the standard backends from a snapshot of the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(&EnvVars::from_process())
    }

    /// Load the standard backends from an environment snapshot.
    pub fn from_vars(env: &EnvVars) -> Self {
        let mut entries = IndexMap::new();

        for defaults in STANDARD_BACKENDS {
            let entry = match defaults.load(env) {
                Ok(config) => {
                    debug!(connection = %config.name, driver = %config.driver, "Loaded backend configuration");
                    RegistryEntry::Valid(Arc::new(config))
                }
                Err(invalid) => {
                    warn!(
                        connection = defaults.name,
                        error = %invalid.message,
                        "Invalid backend configuration"
                    );
                    RegistryEntry::Invalid(invalid)
                }
            };
            entries.insert(defaults.name.to_string(), entry);
        }

        let default = env
            .optional_string("DB_CONNECTION")
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_CONNECTION.to_string());

        if !entries.contains_key(&default) {
            warn!(connection = %default, "Default connection is not configured");
            entries.insert(
                default.clone(),
                RegistryEntry::Invalid(InvalidBackend {
                    driver: "unknown".to_string(),
                    message: format!("Default connection '{}' is not configured", default),
                }),
            );
        }

        Self { entries, default }
    }

    /// Resolve a name to its configuration.
    pub fn resolve(&self, name: &str) -> DbResult<Arc<BackendConfig>> {
        match self.entries.get(name) {
            Some(RegistryEntry::Valid(config)) => Ok(Arc::clone(config)),
            Some(RegistryEntry::Invalid(invalid)) => {
                Err(DbError::config(name, invalid.message.clone()))
            }
            None => Err(DbError::unknown_connection(name)),
        }
    }

    /// Name used when a caller does not specify one.
    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// All configured names in declaration order, valid or not.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the invalid entry for a name, if it is one.
    pub fn invalid(&self, name: &str) -> Option<&InvalidBackend> {
        match self.entries.get(name) {
            Some(RegistryEntry::Invalid(invalid)) => Some(invalid),
            _ => None,
        }
    }
}

/// Builder for [`BackendRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: IndexMap<String, RegistryEntry>,
    duplicates: Vec<String>,
    default: Option<String>,
}

impl RegistryBuilder {
    /// Add a backend. The first backend added becomes the default unless
    /// [`default_connection`](Self::default_connection) says otherwise.
    pub fn backend(mut self, config: BackendConfig) -> Self {
        let name = config.name.clone();
        if self.entries.contains_key(&name) {
            self.duplicates.push(name);
        } else {
            self.entries
                .insert(name, RegistryEntry::Valid(Arc::new(config)));
        }
        self
    }

    /// Add a named entry that always fails to resolve.
    pub fn invalid_backend(
        mut self,
        name: impl Into<String>,
        driver: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let name = name.into();
        if self.entries.contains_key(&name) {
            self.duplicates.push(name);
        } else {
            self.entries.insert(
                name,
                RegistryEntry::Invalid(InvalidBackend {
                    driver: driver.into(),
                    message: message.into(),
                }),
            );
        }
        self
    }

    pub fn default_connection(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    pub fn build(self) -> DbResult<BackendRegistry> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(DbError::config(name, "Duplicate connection name"));
        }

        let default = match self.default {
            Some(name) => name,
            None => self
                .entries
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| DbError::config("default", "Registry has no backends"))?,
        };
        if !self.entries.contains_key(&default) {
            return Err(DbError::config(
                default,
                "Default connection is not among the configured backends",
            ));
        }

        Ok(BackendRegistry {
            entries: self.entries,
            default,
        })
    }
}

/// Environment defaults for one standard backend.
struct BackendDefaults {
    name: &'static str,
    /// Prefix for HOST, PORT, DATABASE, ... keys. `None` for fixed backends.
    prefix: Option<&'static str>,
    /// Variable that may override the driver
    driver_key: Option<&'static str>,
    driver: &'static str,
    host: &'static str,
    port: u16,
    database: &'static str,
    username: &'static str,
    password: &'static str,
    charset: Option<&'static str>,
    collation: Option<&'static str>,
    table_prefix: &'static str,
    strict: bool,
    buffered: bool,
    connect_timeout_secs: u64,
    query_timeout_secs: u64,
}

const STANDARD_BACKENDS: &[BackendDefaults] = &[
    BackendDefaults {
        name: "mysql",
        prefix: Some("DB_"),
        driver_key: None,
        driver: "mysql",
        host: "db",
        port: 3306,
        database: "docker_php_api",
        username: "root",
        password: "root_password",
        charset: Some("utf8mb4"),
        collation: Some("utf8mb4_unicode_ci"),
        table_prefix: "",
        strict: true,
        buffered: true,
        connect_timeout_secs: 30,
        query_timeout_secs: 30,
    },
    BackendDefaults {
        name: "secondary",
        prefix: Some("DB_SECONDARY_"),
        driver_key: Some("DB_SECONDARY_CONNECTION"),
        driver: "mysql",
        host: "db_secondary",
        port: 3306,
        database: "secondary_db",
        username: "secondary_user",
        password: "secondary_password",
        charset: Some("utf8mb4"),
        collation: Some("utf8mb4_unicode_ci"),
        table_prefix: "",
        strict: true,
        buffered: true,
        connect_timeout_secs: 30,
        query_timeout_secs: 30,
    },
    BackendDefaults {
        name: "analytics",
        prefix: Some("DB_ANALYTICS_"),
        driver_key: Some("DB_ANALYTICS_CONNECTION"),
        driver: "mysql",
        host: "analytics_db",
        port: 3306,
        database: "analytics",
        username: "analytics_user",
        password: "analytics_password",
        charset: Some("utf8mb4"),
        collation: Some("utf8mb4_unicode_ci"),
        table_prefix: "analytics_",
        strict: false,
        buffered: false,
        connect_timeout_secs: 60,
        query_timeout_secs: 120,
    },
    BackendDefaults {
        name: "pgsql",
        prefix: Some("DB_POSTGRES_"),
        driver_key: Some("DB_POSTGRES_CONNECTION"),
        driver: "pgsql",
        host: "postgres_host",
        port: 5432,
        database: "postgres_db",
        username: "postgres_user",
        password: "postgres_password",
        charset: Some("utf8"),
        collation: None,
        table_prefix: "",
        strict: true,
        buffered: true,
        connect_timeout_secs: 30,
        query_timeout_secs: 30,
    },
    BackendDefaults {
        name: "sqlite",
        prefix: Some("DB_SQLITE_"),
        driver_key: Some("DB_SQLITE_CONNECTION"),
        driver: "sqlite",
        host: "",
        port: 0,
        database: "storage/database.sqlite",
        username: "",
        password: "",
        charset: None,
        collation: None,
        table_prefix: "",
        strict: true,
        buffered: true,
        connect_timeout_secs: 30,
        query_timeout_secs: 30,
    },
    BackendDefaults {
        name: "testing",
        prefix: None,
        driver_key: None,
        driver: "memory",
        host: "",
        port: 0,
        database: ":memory:",
        username: "",
        password: "",
        charset: None,
        collation: None,
        table_prefix: "",
        strict: true,
        buffered: true,
        connect_timeout_secs: 30,
        query_timeout_secs: 30,
    },
];

impl BackendDefaults {
    fn load(&self, env: &EnvVars) -> Result<BackendConfig, InvalidBackend> {
        let driver_name = self
            .driver_key
            .and_then(|key| env.optional_string(key))
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| self.driver.to_string());
        let invalid = |message: String| InvalidBackend {
            driver: driver_name.clone(),
            message,
        };

        let driver = DriverKind::parse(&driver_name)
            .ok_or_else(|| invalid(format!("Unsupported driver '{}'", driver_name)))?;

        self.builder(driver, self.prefix, env)
            .map_err(|e| invalid(message_of(e)))
    }

    fn builder(
        &self,
        driver: DriverKind,
        prefix: Option<&str>,
        env: &EnvVars,
    ) -> DbResult<BackendConfig> {
        let fail = |message: String| DbError::config(self.name, message);
        let key = |suffix: &str| format!("{}{}", prefix.unwrap_or_default(), suffix);

        let mut builder = BackendConfig::builder(self.name, driver)
            .table_prefix(self.table_prefix)
            .strict(self.strict)
            .connect_timeout_secs(self.connect_timeout_secs)
            .query_timeout_secs(self.query_timeout_secs);
        if let Some(charset) = self.charset {
            builder = builder.charset(charset);
        }
        if let Some(collation) = self.collation {
            builder = builder.collation(collation);
        }

        let driver_options = match driver {
            DriverKind::MySql => DriverOptions::MySql(MySqlOptions {
                buffered: self.buffered,
                emulate_prepares: false,
            }),
            DriverKind::Postgres => DriverOptions::Postgres(PostgresOptions::default()),
            DriverKind::Sqlite | DriverKind::InMemory => {
                DriverOptions::Sqlite(SqliteOptions::default())
            }
        };
        builder = builder.driver_options(driver_options);

        if prefix.is_none() {
            return builder.database(self.database).build();
        }

        if driver.is_networked() {
            let default_port = if self.port == 0 {
                driver.default_port().unwrap_or_default()
            } else {
                self.port
            };
            // A null host stays unset and the builder reports it as missing.
            if let Some(host) = env.string(&key("HOST"), self.host) {
                builder = builder.host(host);
            }
            builder = builder
                .port(env.number(&key("PORT"), default_port).map_err(fail)?)
                .credentials(
                    env.string(&key("USERNAME"), self.username)
                        .unwrap_or_default(),
                    env.string(&key("PASSWORD"), self.password),
                );
        }

        if let Some(database) = env.string(&key("DATABASE"), self.database) {
            builder = builder.database(database);
        }
        if let Some(url) = env.optional_string(&key("URL")).filter(|u| !u.is_empty()) {
            builder = builder.url(url);
        }

        let pool = PoolOptions {
            max_connections: match env.optional_string(&key("POOL_MAX")) {
                Some(_) => Some(env.number(&key("POOL_MAX"), 0u32).map_err(fail)?),
                None => None,
            },
            ..PoolOptions::default()
        };

        builder
            .pool(pool)
            .connect_timeout_secs(
                env.number(&key("CONNECT_TIMEOUT"), self.connect_timeout_secs)
                    .map_err(fail)?,
            )
            .query_timeout_secs(
                env.number(&key("QUERY_TIMEOUT"), self.query_timeout_secs)
                    .map_err(fail)?,
            )
            .build()
    }
}

fn message_of(err: DbError) -> String {
    match err {
        DbError::Config { message, .. } => message,
        other => other.to_string(),
    }
}
