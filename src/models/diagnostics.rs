//! Health and status reports produced by the connection manager.

use crate::models::DriverKind;
use serde::Serialize;

/// Outcome of a `SELECT 1` probe. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResult {
    pub connection: String,
    pub success: bool,
    /// Round trip in milliseconds, present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<f64>,
    pub message: String,
}

impl HealthResult {
    pub fn success(connection: impl Into<String>, elapsed_ms: f64) -> Self {
        Self {
            connection: connection.into(),
            success: true,
            elapsed_ms: Some(elapsed_ms),
            message: "Connection successful".to_string(),
        }
    }

    pub fn failure(connection: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            success: false,
            elapsed_ms: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Error,
}

/// Status line for one configured backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionReport {
    pub name: String,
    /// Configured driver name (`mysql`, `pgsql`, `sqlite`), or the raw value
    /// when it is not supported
    pub driver: String,
    /// "N/A" for file and memory backends
    pub host: String,
    pub database: String,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionReport {
    pub fn connected(
        name: impl Into<String>,
        driver: DriverKind,
        host: impl Into<String>,
        database: impl Into<String>,
        server_version: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            driver: driver.as_str().to_string(),
            host: host.into(),
            database: database.into(),
            status: ConnectionStatus::Connected,
            server_version,
            error: None,
        }
    }

    pub fn error(
        name: impl Into<String>,
        driver: impl Into<String>,
        host: impl Into<String>,
        database: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            host: host.into(),
            database: database.into(),
            status: ConnectionStatus::Error,
            server_version: None,
            error: Some(error.into()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Manager-wide counters and process memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// True once any connection has been created
    pub initialized: bool,
    pub active_connections: usize,
    /// Resident set size in bytes
    pub memory_usage: Option<u64>,
    pub memory_usage_human: String,
    /// Peak resident set size in bytes
    pub peak_memory_usage: Option<u64>,
    pub peak_memory_usage_human: String,
    /// Query log entries lost to sink failures
    pub dropped_log_entries: u64,
}

impl ManagerStats {
    pub fn new(
        initialized: bool,
        active_connections: usize,
        memory_usage: Option<u64>,
        peak_memory_usage: Option<u64>,
        dropped_log_entries: u64,
    ) -> Self {
        Self {
            initialized,
            active_connections,
            memory_usage,
            memory_usage_human: format_bytes(memory_usage),
            peak_memory_usage,
            peak_memory_usage_human: format_bytes(peak_memory_usage),
            dropped_log_entries,
        }
    }
}

/// Format a byte count for people, "N/A" when unknown.
pub fn format_bytes(bytes: Option<u64>) -> String {
    match bytes {
        Some(b) => humansize::format_size(b, humansize::WINDOWS),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_health_result_shapes() {
        let ok = HealthResult::success("mysql", 1.25);
        assert!(ok.success);
        assert_eq!(ok.elapsed_ms, Some(1.25));

        let failed = HealthResult::failure("analytics", "Connection refused");
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["success"], json!(false));
        assert!(value.get("elapsed_ms").is_none());
    }

    #[test]
    fn test_report_serialization() {
        let report = ConnectionReport::connected(
            "testing",
            DriverKind::InMemory,
            "N/A",
            ":memory:",
            Some("3.45.0".to_string()),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["driver"], json!("sqlite"));
        assert_eq!(value["status"], json!("connected"));
        assert_eq!(value["server_version"], json!("3.45.0"));
        assert!(value.get("error").is_none());

        let report = ConnectionReport::error("pgsql", "oracle", "N/A", "N/A", "Unsupported");
        assert!(!report.is_connected());
        assert_eq!(report.error.as_deref(), Some("Unsupported"));
    }

    #[test]
    fn test_stats_carry_human_memory_in_json() {
        let stats = ManagerStats::new(true, 2, Some(3 * 1024 * 1024), None, 0);
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["memory_usage"], json!(3 * 1024 * 1024));
        assert_eq!(value["memory_usage_human"], json!("3 MB"));
        assert_eq!(value["peak_memory_usage"], json!(null));
        assert_eq!(value["peak_memory_usage_human"], json!("N/A"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(None), "N/A");
        assert_eq!(format_bytes(Some(2048)), "2 kB");
        assert_eq!(format_bytes(Some(512)), "512 B");
    }
}
