//! Query router.
//!
//! Routes a statement to the right execution path by its leading keyword, and
//! times and records every execution, failed ones included. The same
//! [`Router`] serves pool-level calls on the manager and calls inside a
//! [`TransactionScope`](crate::db::TransactionScope).

use crate::db::classify::classify;
use crate::db::executor::{self, ExecOptions, RowCallback, Target};
use crate::db::instrumentation::QueryLogger;
use crate::db::manager::ConnectionManager;
use crate::db::pool::ConnectionHandle;
use crate::error::DbResult;
use crate::models::{QueryOutcome, QueryParam, Row, StatementKind};

/// Instrumented statement runner bound to one connection.
pub(crate) struct Router<'a> {
    connection: &'a str,
    logger: &'a QueryLogger,
    opts: ExecOptions,
}

impl<'a> Router<'a> {
    pub fn new(handle: &'a ConnectionHandle, logger: &'a QueryLogger) -> Self {
        Self {
            connection: handle.name(),
            logger,
            opts: ExecOptions::for_backend(handle.config()),
        }
    }

    pub fn options(&self) -> &ExecOptions {
        &self.opts
    }

    pub async fn select(
        &self,
        target: Target<'_>,
        sql: &str,
        bindings: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        self.logger
            .observe(
                self.connection,
                StatementKind::Read,
                sql,
                bindings,
                executor::fetch_rows(target, sql, bindings, &self.opts),
            )
            .await
    }

    /// Stream rows into `on_row` without collecting them.
    pub async fn select_each(
        &self,
        target: Target<'_>,
        sql: &str,
        bindings: &[QueryParam],
        on_row: &mut RowCallback<'_>,
    ) -> DbResult<u64> {
        self.logger
            .observe(
                self.connection,
                StatementKind::Read,
                sql,
                bindings,
                executor::for_each_row(target, sql, bindings, &self.opts, on_row),
            )
            .await
    }

    /// Run a statement for its affected row count.
    pub async fn affecting(
        &self,
        target: Target<'_>,
        kind: StatementKind,
        sql: &str,
        bindings: &[QueryParam],
    ) -> DbResult<u64> {
        let summary = self
            .logger
            .observe(
                self.connection,
                kind,
                sql,
                bindings,
                executor::execute(target, sql, bindings, &self.opts),
            )
            .await?;
        Ok(summary.rows_affected)
    }

    pub async fn insert_get_id(
        &self,
        target: Target<'_>,
        sql: &str,
        bindings: &[QueryParam],
    ) -> DbResult<i64> {
        self.logger
            .observe(
                self.connection,
                StatementKind::Write,
                sql,
                bindings,
                executor::insert_get_id(target, sql, bindings, &self.opts),
            )
            .await
    }

    /// Classify and route.
    pub async fn execute(
        &self,
        target: Target<'_>,
        sql: &str,
        bindings: &[QueryParam],
    ) -> DbResult<QueryOutcome> {
        let outcome = match classify(sql) {
            StatementKind::Read => QueryOutcome::Rows {
                rows: self.select(target, sql, bindings).await?,
            },
            StatementKind::Write => QueryOutcome::Affected {
                rows_affected: self
                    .affecting(target, StatementKind::Write, sql, bindings)
                    .await?,
            },
            StatementKind::Other => QueryOutcome::Statement {
                rows_affected: self
                    .affecting(target, StatementKind::Other, sql, bindings)
                    .await?,
            },
        };
        Ok(outcome)
    }
}

/// Pool-level routed statements. `name` selects the connection, the default one
/// when `None`.
impl ConnectionManager {
    /// Classify `sql` by its leading keyword and run it accordingly.
    pub async fn execute(
        &self,
        sql: &str,
        bindings: &[QueryParam],
        name: Option<&str>,
    ) -> DbResult<QueryOutcome> {
        let handle = self.connection(name).await?;
        Router::new(&handle, self.logger())
            .execute(Target::Pool(handle.pool()), sql, bindings)
            .await
    }

    pub async fn select(
        &self,
        sql: &str,
        bindings: &[QueryParam],
        name: Option<&str>,
    ) -> DbResult<Vec<Row>> {
        let handle = self.connection(name).await?;
        Router::new(&handle, self.logger())
            .select(Target::Pool(handle.pool()), sql, bindings)
            .await
    }

    /// Hand each result row to `on_row` as it is decoded and return the row
    /// count.
    ///
    /// [`select`](Self::select) always returns a `Vec`, even on unbuffered
    /// backends. Use this for large reads where only one decoded row should be
    /// held at a time. An error returned by `on_row` stops the read and is
    /// returned as is.
    pub async fn select_each<F>(
        &self,
        sql: &str,
        bindings: &[QueryParam],
        name: Option<&str>,
        mut on_row: F,
    ) -> DbResult<u64>
    where
        F: FnMut(Row) -> DbResult<()> + Send,
    {
        let handle = self.connection(name).await?;
        Router::new(&handle, self.logger())
            .select_each(Target::Pool(handle.pool()), sql, bindings, &mut on_row)
            .await
    }

    /// Returns the number of inserted rows.
    pub async fn insert(
        &self,
        sql: &str,
        bindings: &[QueryParam],
        name: Option<&str>,
    ) -> DbResult<u64> {
        self.write(StatementKind::Write, sql, bindings, name).await
    }

    /// Returns the number of updated rows.
    pub async fn update(
        &self,
        sql: &str,
        bindings: &[QueryParam],
        name: Option<&str>,
    ) -> DbResult<u64> {
        self.write(StatementKind::Write, sql, bindings, name).await
    }

    /// Returns the number of deleted rows.
    pub async fn delete(
        &self,
        sql: &str,
        bindings: &[QueryParam],
        name: Option<&str>,
    ) -> DbResult<u64> {
        self.write(StatementKind::Write, sql, bindings, name).await
    }

    /// Run any statement, typically DDL, and return the driver's affected count.
    pub async fn statement(
        &self,
        sql: &str,
        bindings: &[QueryParam],
        name: Option<&str>,
    ) -> DbResult<u64> {
        self.write(StatementKind::Other, sql, bindings, name).await
    }

    /// Run an INSERT and return the generated key.
    pub async fn insert_get_id(
        &self,
        sql: &str,
        bindings: &[QueryParam],
        name: Option<&str>,
    ) -> DbResult<i64> {
        let handle = self.connection(name).await?;
        Router::new(&handle, self.logger())
            .insert_get_id(Target::Pool(handle.pool()), sql, bindings)
            .await
    }

    async fn write(
        &self,
        kind: StatementKind,
        sql: &str,
        bindings: &[QueryParam],
        name: Option<&str>,
    ) -> DbResult<u64> {
        let handle = self.connection(name).await?;
        Router::new(&handle, self.logger())
            .affecting(Target::Pool(handle.pool()), kind, sql, bindings)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryLogConfig;
    use crate::db::factory::SqlxConnectionFactory;
    use crate::db::instrumentation::CollectingSink;
    use crate::db::registry::BackendRegistry;
    use crate::models::{BackendConfig, DriverKind};
    use serde_json::json;
    use std::sync::Arc;

    fn manager(sink: Arc<CollectingSink>) -> ConnectionManager {
        let registry = BackendRegistry::builder()
            .backend(
                BackendConfig::builder("testing", DriverKind::InMemory)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        ConnectionManager::new(
            registry,
            Arc::new(SqlxConnectionFactory::new()),
            QueryLogger::new(QueryLogConfig::all_queries(), sink),
        )
    }

    #[tokio::test]
    async fn test_execute_routes_by_keyword() {
        let sink = Arc::new(CollectingSink::new());
        let manager = manager(sink.clone());

        let created = manager
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[], None)
            .await
            .unwrap();
        assert!(matches!(created, QueryOutcome::Statement { .. }));

        let inserted = manager
            .execute("INSERT INTO t (v) VALUES (?)", &["x".into()], None)
            .await
            .unwrap();
        assert_eq!(inserted, QueryOutcome::Affected { rows_affected: 1 });

        let selected = manager
            .execute("  -- comment\nselect v from t", &[], None)
            .await
            .unwrap();
        assert_eq!(selected.rows().len(), 1);
        assert_eq!(selected.rows()[0]["v"], json!("x"));

        let kinds: Vec<StatementKind> = sink.entries().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [StatementKind::Other, StatementKind::Write, StatementKind::Read]
        );
    }

    #[tokio::test]
    async fn test_select_each_streams_rows() {
        let sink = Arc::new(CollectingSink::new());
        let manager = manager(sink.clone());
        manager
            .statement("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[], None)
            .await
            .unwrap();
        for v in ["a", "b"] {
            manager
                .insert("INSERT INTO t (v) VALUES (?)", &[v.into()], None)
                .await
                .unwrap();
        }
        sink.clear();

        let mut values = Vec::new();
        let count = manager
            .select_each("SELECT v FROM t ORDER BY id", &[], None, |row| {
                values.push(row["v"].clone());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(values, [json!("a"), json!("b")]);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, StatementKind::Read);
    }

    #[tokio::test]
    async fn test_select_with_backslash_literal_returns_rows() {
        let manager = manager(Arc::new(CollectingSink::new()));
        let outcome = manager
            .execute(r"SELECT 'C:\' AS path", &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.rows().len(), 1);
        assert_eq!(outcome.rows()[0]["path"], json!(r"C:\"));
    }

    #[tokio::test]
    async fn test_failures_are_recorded() {
        let sink = Arc::new(CollectingSink::new());
        let manager = manager(sink.clone());

        let err = manager
            .select("SELECT * FROM missing", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "query");

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].connection, "testing");
        assert!(entries[0].error.is_some());
    }

    #[tokio::test]
    async fn test_write_entry_points() {
        let manager = manager(Arc::new(CollectingSink::new()));
        manager
            .statement("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[], None)
            .await
            .unwrap();

        let id = manager
            .insert_get_id("INSERT INTO t (v) VALUES (?)", &["a".into()], None)
            .await
            .unwrap();
        assert_eq!(
            manager
                .insert("INSERT INTO t (v) VALUES (?)", &["b".into()], None)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            manager
                .update("UPDATE t SET v = ? WHERE id = ?", &["c".into(), id.into()], None)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            manager
                .delete("DELETE FROM t", &[], Some("testing"))
                .await
                .unwrap(),
            2
        );
    }
}
