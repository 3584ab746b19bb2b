//! Configuration handling for the connection manager.
//!
//! Backend records are sourced from the process environment. Raw values go through
//! the same coercion rules everywhere (`true`, `(false)`, `empty`, `null`, ...), and
//! the environment is snapshotted once so repeated resolution never observes a
//! half-changed environment. The `multidb` binary adds CLI arguments on top via clap.

use crate::format::OutputFormat;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONNECTION: &str = "mysql";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 2000;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// A typed environment value after coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Bool(bool),
    Text(String),
    /// `null` / `(null)`: explicitly no value.
    Null,
}

impl EnvValue {
    /// Coerce a raw environment string.
    ///
    /// Matching is case-insensitive. `empty` becomes an empty string; anything that
    /// is not one of the special words stays text unchanged.
    pub fn coerce(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "true" | "(true)" => Self::Bool(true),
            "false" | "(false)" => Self::Bool(false),
            "empty" | "(empty)" => Self::Text(String::new()),
            "null" | "(null)" => Self::Null,
            _ => Self::Text(raw.to_string()),
        }
    }
}

/// Immutable snapshot of environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvVars {
    vars: HashMap<String, String>,
}

impl EnvVars {
    /// Snapshot the current process environment.
    pub fn from_process() -> Self {
        Self::from_pairs(std::env::vars())
    }

    /// Build a snapshot from explicit pairs (useful for testing).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Get a coerced value. `None` means the variable is not set at all.
    pub fn get(&self, key: &str) -> Option<EnvValue> {
        self.vars.get(key).map(|raw| EnvValue::coerce(raw))
    }

    /// Get a string value, falling back to `default` when unset.
    /// Returns `None` when the variable is explicitly `null`.
    pub fn string(&self, key: &str, default: &str) -> Option<String> {
        match self.get(key) {
            None => Some(default.to_string()),
            Some(EnvValue::Null) => None,
            Some(EnvValue::Bool(b)) => Some(b.to_string()),
            Some(EnvValue::Text(s)) => Some(s),
        }
    }

    /// Get an optional string value without a default.
    pub fn optional_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            EnvValue::Null => None,
            EnvValue::Bool(b) => Some(b.to_string()),
            EnvValue::Text(s) => Some(s),
        }
    }

    /// Get a boolean flag. `null` falls back to the default.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool, String> {
        match self.get(key) {
            None | Some(EnvValue::Null) => Ok(default),
            Some(EnvValue::Bool(b)) => Ok(b),
            Some(EnvValue::Text(s)) => Err(format!("{key} must be true or false, got '{s}'")),
        }
    }

    /// Get a numeric value. `null` and empty values fall back to the default.
    pub fn number<T: FromStr>(&self, key: &str, default: T) -> Result<T, String> {
        match self.get(key) {
            None | Some(EnvValue::Null) => Ok(default),
            Some(EnvValue::Text(s)) if s.trim().is_empty() => Ok(default),
            Some(EnvValue::Text(s)) => s
                .trim()
                .parse()
                .map_err(|_| format!("{key} must be a number, got '{s}'")),
            Some(EnvValue::Bool(b)) => Err(format!("{key} must be a number, got '{b}'")),
        }
    }
}

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10 for MySQL/PostgreSQL, 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Whether to test connections before use (default: true)
    pub test_before_acquire: Option<bool>,
}

impl PoolOptions {
    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    /// Get min_connections with default value.
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    /// Get test_before_acquire with default value.
    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Query logging policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLogConfig {
    /// Master switch for query logging.
    pub enabled: bool,
    /// Log every executed statement.
    pub log_queries: bool,
    /// Log statements slower than the threshold (when `log_queries` is off).
    pub log_slow_queries: bool,
    pub slow_query_threshold_ms: u64,
}

impl QueryLogConfig {
    /// Read `DB_LOGGING`, `LOG_QUERIES`, `LOG_SLOW_QUERIES` and `SLOW_QUERY_THRESHOLD`.
    pub fn from_env(env: &EnvVars) -> Result<Self, String> {
        Ok(Self {
            enabled: env.flag("DB_LOGGING", true)?,
            log_queries: env.flag("LOG_QUERIES", false)?,
            log_slow_queries: env.flag("LOG_SLOW_QUERIES", true)?,
            slow_query_threshold_ms: env
                .number("SLOW_QUERY_THRESHOLD", DEFAULT_SLOW_QUERY_THRESHOLD_MS)?,
        })
    }

    /// Log nothing at all.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Log every statement.
    pub fn all_queries() -> Self {
        Self {
            log_queries: true,
            ..Self::default()
        }
    }

    /// Get the slow query threshold as a Duration.
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }

    /// Whether an entry with the given slowness should reach the sink.
    pub fn should_log(&self, is_slow: bool) -> bool {
        self.enabled && (self.log_queries || (self.log_slow_queries && is_slow))
    }
}

impl Default for QueryLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_queries: false,
            log_slow_queries: true,
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
        }
    }
}

/// Subcommands of the diagnostic CLI.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Report the status of every configured connection
    Connections,
    /// Run a health probe against one connection
    Test {
        /// Connection name
        name: String,
    },
    /// Show manager statistics
    Stats,
    /// Run a statement through the query router
    Query {
        /// Connection name (defaults to DB_CONNECTION)
        #[arg(short, long)]
        connection: Option<String>,
        /// Output format for row results
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
        /// SQL statement
        sql: String,
    },
}

/// Configuration for the `multidb` diagnostic CLI.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "multidb",
    about = "Inspect and query the configured database backends",
    version,
    author
)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MULTIDB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "MULTIDB_JSON_LOGS")]
    pub json_logs: bool,

    /// Path to a .env file loaded before reading backend configuration
    #[arg(long = "env-file", value_name = "PATH", env = "MULTIDB_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}
