//! Statement classification by leading keyword.
//!
//! Uses the sqlparser tokenizer (MySQL dialect, which understands `--`, `#` and
//! `/* */` comments) and looks only at the first keyword after whitespace,
//! comments and opening parentheses. No parsing beyond that happens here; the
//! database remains the judge of whether the statement is valid.

use crate::models::StatementKind;
use sqlparser::dialect::MySqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

const READ_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "WITH"];
const WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE"];

/// Classify a SQL statement.
///
/// Statements whose start cannot be tokenized are [`StatementKind::Other`] and go
/// to the server unprepared, which reports the actual error.
pub fn classify(sql: &str) -> StatementKind {
    match leading_keyword(sql) {
        Some(word) if READ_KEYWORDS.contains(&word.as_str()) => StatementKind::Read,
        Some(word) if WRITE_KEYWORDS.contains(&word.as_str()) => StatementKind::Write,
        _ => StatementKind::Other,
    }
}

/// First unquoted word of the statement, upper-cased.
///
/// The tokenizer keeps the tokens it produced before an error, so a tail that
/// only another dialect accepts (backslashes in string literals, `$$` bodies)
/// does not hide the leading keyword.
fn leading_keyword(sql: &str) -> Option<String> {
    let dialect = MySqlDialect {};
    let mut tokens = Vec::new();
    let _ = Tokenizer::new(&dialect, sql).tokenize_with_location_into_buf(&mut tokens);

    tokens
        .into_iter()
        .map(|spanned| spanned.token)
        .find(|token| !matches!(token, Token::Whitespace(_) | Token::LParen))
        .and_then(|token| match token {
            Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_uppercase()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_keywords() {
        for sql in [
            "SELECT 1",
            "show tables",
            "DESCRIBE users",
            "desc users",
            "Explain SELECT * FROM t",
            "WITH x AS (SELECT 1) SELECT * FROM x",
        ] {
            assert_eq!(classify(sql), StatementKind::Read, "{sql}");
        }
    }

    #[test]
    fn test_write_keywords() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "update t set a = 1",
            "Delete FROM t WHERE id = 1",
        ] {
            assert_eq!(classify(sql), StatementKind::Write, "{sql}");
        }
    }

    #[test]
    fn test_other_statements() {
        for sql in [
            "CREATE TABLE t (id INT)",
            "DROP TABLE t",
            "TRUNCATE t",
            "PRAGMA foreign_keys",
            "",
            "   ",
            "-- only a comment",
        ] {
            assert_eq!(classify(sql), StatementKind::Other, "{sql:?}");
        }
    }

    #[test]
    fn test_skips_whitespace_and_comments() {
        assert_eq!(classify("\n\t  select 1"), StatementKind::Read);
        assert_eq!(classify("-- note\nSELECT 1"), StatementKind::Read);
        assert_eq!(classify("# mysql note\nDELETE FROM t"), StatementKind::Write);
        assert_eq!(
            classify("/* hint */ /* another */ INSERT INTO t VALUES (1)"),
            StatementKind::Write
        );
    }

    #[test]
    fn test_skips_leading_parentheses() {
        assert_eq!(
            classify("((SELECT 1) UNION (SELECT 2))"),
            StatementKind::Read
        );
    }

    #[test]
    fn test_only_the_leading_keyword_matters() {
        for (sql, kind) in [
            (r"SELECT 'C:\' AS path", StatementKind::Read),
            (r"select 'a\' || 'b'", StatementKind::Read),
            (r"INSERT INTO paths VALUES ('C:\')", StatementKind::Write),
            ("SELECT $$unterminated", StatementKind::Read),
            ("UPDATE t SET note = 'open", StatementKind::Write),
            ("/* unterminated comment SELECT 1", StatementKind::Other),
        ] {
            assert_eq!(classify(sql), kind, "{sql}");
        }
    }

    #[test]
    fn test_keyword_must_be_a_whole_word() {
        assert_eq!(classify("SELECTED_ROWS"), StatementKind::Other);
        assert_eq!(classify("`select` 1"), StatementKind::Other);
    }
}
