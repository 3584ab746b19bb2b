//! Output formatting for the `multidb` CLI.
//!
//! Renders decoded rows as JSON, an ASCII table like the MySQL client, or a
//! Markdown table.

use crate::models::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use unicode_width::UnicodeWidthStr;

/// Output format for row results.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// ASCII table format (like MySQL CLI)
    Table,
    /// Markdown table format
    Markdown,
}

impl OutputFormat {
    /// Render `rows` in this format.
    pub fn render(&self, rows: &[Row], elapsed_ms: f64) -> String {
        match self {
            OutputFormat::Json => {
                serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string())
            }
            OutputFormat::Table => format_as_table(rows, elapsed_ms),
            OutputFormat::Markdown => format_as_markdown(rows),
        }
    }
}

pub fn format_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(arr) => serde_json::to_string(arr).unwrap_or_default(),
        JsonValue::Object(obj) => serde_json::to_string(obj).unwrap_or_default(),
    }
}

/// Column names taken from the first row; rows share one select list.
fn columns(rows: &[Row]) -> Vec<&str> {
    rows.first()
        .map(|row| row.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

pub fn format_as_table(rows: &[Row], elapsed_ms: f64) -> String {
    let columns = columns(rows);
    if columns.is_empty() {
        return format!("Empty set ({:.2} sec)\n", elapsed_ms / 1000.0);
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.width()).collect();
    for row in rows {
        for (i, col) in columns.iter().enumerate() {
            if let Some(value) = row.get(*col) {
                widths[i] = widths[i].max(format_value(value).width());
            }
        }
    }

    let mut output = String::new();
    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+\n";

    output.push_str(&separator);
    let header: String = columns
        .iter()
        .zip(&widths)
        .map(|(col, w)| format!("| {} ", pad_center(col, *w)))
        .collect::<String>()
        + "|\n";
    output.push_str(&header);
    output.push_str(&separator);

    for row in rows {
        let line: String = columns
            .iter()
            .zip(&widths)
            .map(|(col, w)| {
                let value = row.get(*col).unwrap_or(&JsonValue::Null);
                let formatted = format_value(value);
                if matches!(value, JsonValue::Number(_)) {
                    format!("| {} ", pad_left(&formatted, *w))
                } else {
                    format!("| {} ", pad_right(&formatted, *w))
                }
            })
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }

    output.push_str(&separator);

    let row_text = if rows.len() == 1 { "row" } else { "rows" };
    output.push_str(&format!(
        "{} {} in set ({:.2} sec)\n",
        rows.len(),
        row_text,
        elapsed_ms / 1000.0
    ));

    output
}

pub fn format_as_markdown(rows: &[Row]) -> String {
    let columns = columns(rows);
    if columns.is_empty() {
        return "*Empty set*".to_string();
    }

    let mut output = String::new();

    let header: String = columns
        .iter()
        .map(|c| format!("| {} ", c))
        .collect::<String>()
        + "|\n";
    output.push_str(&header);

    let sep: String = columns.iter().map(|_| "|---").collect::<String>() + "|\n";
    output.push_str(&sep);

    for row in rows {
        let line: String = columns
            .iter()
            .map(|col| {
                let value = row.get(*col).unwrap_or(&JsonValue::Null);
                format!("| {} ", format_value(value).replace('|', "\\|"))
            })
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }

    output.push_str(&format!("\n*{} rows*", rows.len()));

    output
}

// std's `{:width$}` counts chars, not display columns
fn pad_right(s: &str, width: usize) -> String {
    format!("{}{}", s, " ".repeat(width.saturating_sub(s.width())))
}

fn pad_left(s: &str, width: usize) -> String {
    format!("{}{}", " ".repeat(width.saturating_sub(s.width())), s)
}

fn pad_center(s: &str, width: usize) -> String {
    let total = width.saturating_sub(s.width());
    let left = total / 2;
    format!("{}{}{}", " ".repeat(left), s, " ".repeat(total - left))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Row> {
        let mut first = Row::new();
        first.insert("id".to_string(), json!(1));
        first.insert("name".to_string(), json!("Alice"));
        let mut second = Row::new();
        second.insert("id".to_string(), json!(10));
        second.insert("name".to_string(), JsonValue::Null);
        vec![first, second]
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&JsonValue::Null), "NULL");
        assert_eq!(format_value(&json!(true)), "true");
        assert_eq!(format_value(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_table_layout() {
        let table = format_as_table(&rows(), 1500.0);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "+----+-------+");
        assert_eq!(lines[1], "| id | name  |");
        assert_eq!(lines[3], "|  1 | Alice |");
        assert_eq!(lines[4], "| 10 | NULL  |");
        assert_eq!(lines[6], "2 rows in set (1.50 sec)");
    }

    #[test]
    fn test_table_wide_characters() {
        let mut row = Row::new();
        row.insert("name".to_string(), json!("数据库"));
        let table = format_as_table(&[row], 0.0);
        assert!(table.contains("| 数据库 |"));
        assert!(table.starts_with("+--------+"));
    }

    #[test]
    fn test_empty_results() {
        assert_eq!(format_as_table(&[], 0.0), "Empty set (0.00 sec)\n");
        assert_eq!(format_as_markdown(&[]), "*Empty set*");
    }

    #[test]
    fn test_markdown_layout() {
        let md = format_as_markdown(&rows());
        assert!(md.starts_with("| id | name |\n|---|---|\n| 1 | Alice |\n"));
        assert!(md.ends_with("*2 rows*"));
    }

    #[test]
    fn test_render_json_keeps_column_order() {
        let json = OutputFormat::Json.render(&rows(), 0.0);
        let id = json.find("\"id\"").unwrap();
        let name = json.find("\"name\"").unwrap();
        assert!(id < name);
    }
}
