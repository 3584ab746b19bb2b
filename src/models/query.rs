//! Query-related data models.
//!
//! This module defines bound parameters, decoded rows, routed results and the
//! per-statement log entry.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// One decoded row: column name to JSON value, in select-list order.
pub type Row = IndexMap<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Structured JSON value
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Statement class derived from the leading SQL keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    /// SELECT, SHOW, DESCRIBE, DESC, EXPLAIN, WITH
    Read,
    /// INSERT, UPDATE, DELETE
    Write,
    /// DDL and anything unrecognised
    Other,
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Result of a routed statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows { rows: Vec<Row> },
    Affected { rows_affected: u64 },
    /// Raw pass-through result of a statement that is neither read nor write.
    Statement { rows_affected: u64 },
}

impl QueryOutcome {
    /// Rows of a read, empty for everything else.
    pub fn rows(&self) -> &[Row] {
        match self {
            Self::Rows { rows } => rows,
            _ => &[],
        }
    }

    /// Affected row count, `None` for reads.
    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            Self::Rows { .. } => None,
            Self::Affected { rows_affected } | Self::Statement { rows_affected } => {
                Some(*rows_affected)
            }
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows { rows } => rows,
            _ => Vec::new(),
        }
    }
}

/// Record of one executed statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryLogEntry {
    pub sql: String,
    pub bindings: Vec<QueryParam>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub connection: String,
    pub is_slow: bool,
    pub kind: StatementKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryLogEntry {
    /// Elapsed time in milliseconds, two decimals.
    pub fn elapsed_ms(&self) -> f64 {
        (self.elapsed.as_secs_f64() * 100_000.0).round() / 100.0
    }
}

fn serialize_millis<S>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64((elapsed.as_secs_f64() * 100_000.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(
            QueryParam::String("hello".to_string()).type_name(),
            "string"
        );
    }

    #[test]
    fn test_query_param_conversions() {
        assert_eq!(QueryParam::from(7), QueryParam::Int(7));
        assert_eq!(QueryParam::from("a"), QueryParam::String("a".to_string()));
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some(1.5)), QueryParam::Float(1.5));
    }

    #[test]
    fn test_query_param_deserialize_untagged() {
        let params: Vec<QueryParam> =
            serde_json::from_value(json!([null, true, 3, 2.5, "x", {"k": 1}])).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Int(3),
                QueryParam::Float(2.5),
                QueryParam::String("x".to_string()),
                QueryParam::Json(json!({"k": 1})),
            ]
        );
    }

    #[test]
    fn test_outcome_accessors() {
        let mut row = Row::new();
        row.insert("id".to_string(), json!(1));
        let rows = QueryOutcome::Rows {
            rows: vec![row.clone()],
        };
        assert_eq!(rows.rows(), &[row]);
        assert_eq!(rows.rows_affected(), None);

        let affected = QueryOutcome::Affected { rows_affected: 3 };
        assert!(affected.rows().is_empty());
        assert_eq!(affected.rows_affected(), Some(3));
    }

    #[test]
    fn test_row_keeps_column_order() {
        let mut row = Row::new();
        row.insert("zeta".to_string(), json!(1));
        row.insert("alpha".to_string(), json!(2));
        let text = serde_json::to_string(&row).unwrap();
        assert_eq!(text, r#"{"zeta":1,"alpha":2}"#);
    }

    #[test]
    fn test_log_entry_elapsed_ms() {
        let entry = QueryLogEntry {
            sql: "SELECT 1".to_string(),
            bindings: vec![],
            elapsed: Duration::from_micros(2_345_678),
            connection: "mysql".to_string(),
            is_slow: true,
            kind: StatementKind::Read,
            error: None,
        };
        assert_eq!(entry.elapsed_ms(), 2345.68);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["elapsed_ms"], json!(2345.68));
        assert_eq!(value["kind"], json!("read"));
        assert!(value.get("error").is_none());
    }
}
