//! Query logging and process diagnostics.
//!
//! Every routed statement is timed and handed to a [`QueryLogger`], which applies
//! the [`QueryLogConfig`] policy and forwards accepted entries to a [`QuerySink`].
//! A failing or panicking sink never affects the statement that was logged; the
//! entry is dropped and counted instead.

use crate::config::QueryLogConfig;
use crate::error::DbResult;
use crate::models::{QueryLogEntry, QueryParam, StatementKind};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Error returned by a sink that could not store an entry.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Destination for query log entries.
pub trait QuerySink: Send + Sync {
    fn write(&self, entry: &QueryLogEntry) -> Result<(), SinkError>;
}

/// Writes entries as structured `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl QuerySink for TracingSink {
    fn write(&self, entry: &QueryLogEntry) -> Result<(), SinkError> {
        if entry.is_slow || entry.error.is_some() {
            warn!(
                connection = %entry.connection,
                sql = %entry.sql,
                bindings = ?entry.bindings,
                elapsed_ms = entry.elapsed_ms(),
                kind = %entry.kind,
                slow_query = entry.is_slow,
                error = entry.error.as_deref(),
                "Query executed"
            );
        } else {
            debug!(
                connection = %entry.connection,
                sql = %entry.sql,
                bindings = ?entry.bindings,
                elapsed_ms = entry.elapsed_ms(),
                kind = %entry.kind,
                "Query executed"
            );
        }
        Ok(())
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    entries: Mutex<Vec<QueryLogEntry>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected entries.
    pub fn entries(&self) -> Vec<QueryLogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl QuerySink for CollectingSink {
    fn write(&self, entry: &QueryLogEntry) -> Result<(), SinkError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| "collecting sink lock poisoned")?;
        entries.push(entry.clone());
        Ok(())
    }
}

/// Applies the logging policy and isolates callers from sink failures.
pub struct QueryLogger {
    config: QueryLogConfig,
    sink: Arc<dyn QuerySink>,
    dropped: AtomicU64,
}

impl std::fmt::Debug for QueryLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLogger")
            .field("config", &self.config)
            .field("dropped", &self.dropped_entries())
            .finish_non_exhaustive()
    }
}

impl QueryLogger {
    pub fn new(config: QueryLogConfig, sink: Arc<dyn QuerySink>) -> Self {
        Self {
            config,
            sink,
            dropped: AtomicU64::new(0),
        }
    }

    /// Logger writing to `tracing`.
    pub fn tracing(config: QueryLogConfig) -> Self {
        Self::new(config, Arc::new(TracingSink))
    }

    /// Logger that records nothing.
    pub fn disabled() -> Self {
        Self::tracing(QueryLogConfig::disabled())
    }

    pub fn config(&self) -> &QueryLogConfig {
        &self.config
    }

    /// Strictly slower than the threshold.
    pub fn is_slow(&self, elapsed: Duration) -> bool {
        elapsed > self.config.slow_query_threshold()
    }

    /// Entries lost because the sink failed or panicked.
    pub fn dropped_entries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Forward an entry to the sink if the policy accepts it. Never fails.
    pub fn record(&self, entry: QueryLogEntry) {
        if !self.config.should_log(entry.is_slow) {
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| self.sink.write(&entry))) {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Time `work`, record the outcome, and return the result unchanged.
    pub async fn observe<T, F>(
        &self,
        connection: &str,
        kind: StatementKind,
        sql: &str,
        bindings: &[QueryParam],
        work: F,
    ) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let started = Instant::now();
        let result = work.await;
        let elapsed = started.elapsed();
        let is_slow = self.is_slow(elapsed);

        if self.config.should_log(is_slow) {
            self.record(QueryLogEntry {
                sql: sql.to_string(),
                bindings: bindings.to_vec(),
                elapsed,
                connection: connection.to_string(),
                is_slow,
                kind,
                error: result.as_ref().err().map(ToString::to_string),
            });
        }
        result
    }
}

impl Default for QueryLogger {
    fn default() -> Self {
        Self::tracing(QueryLogConfig::default())
    }
}

/// Resident memory of the current process, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessMemory {
    pub resident: Option<u64>,
    pub peak_resident: Option<u64>,
}

impl ProcessMemory {
    /// Read `/proc/self/status`. Both values are `None` where it does not exist.
    pub fn current() -> Self {
        std::fs::read_to_string("/proc/self/status")
            .map(|status| Self::parse_status(&status))
            .unwrap_or_default()
    }

    /// Parse the `VmRSS` and `VmHWM` lines of a proc status file.
    pub fn parse_status(status: &str) -> Self {
        let mut memory = Self::default();
        for line in status.lines() {
            if let Some(value) = line.strip_prefix("VmRSS:") {
                memory.resident = parse_kb(value);
            } else if let Some(value) = line.strip_prefix("VmHWM:") {
                memory.peak_resident = parse_kb(value);
            }
        }
        memory
    }
}

fn parse_kb(value: &str) -> Option<u64> {
    value
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()
        .map(|kb| kb * 1024)
}
