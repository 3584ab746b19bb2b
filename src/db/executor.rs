//! Statement execution engine.
//!
//! Runs one statement against either a pool or an open transaction with:
//! - Parameter binding (prepared, or emulated when the backend asks for it)
//! - Buffered or streamed row decoding
//! - Per-backend statement timeouts
//!
//! # Architecture
//!
//! Database-specific implementations live in submodules:
//! - `mysql`: MySQL reads, writes and generated keys
//! - `postgres`: PostgreSQL reads, writes and `RETURNING` keys
//! - `sqlite`: SQLite reads, writes and rowids
//!
//! Each submodule is generic over `sqlx::Executor`, so a pool reference and a
//! transaction's connection go through the same code. The `dispatch!` macro
//! picks the submodule from the [`Target`].

use crate::db::pool::DbPool;
use crate::db::transaction::DbTransaction;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{BackendConfig, QueryParam, Row};
use futures_util::TryStreamExt;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Per-statement execution settings, derived from the backend record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExecOptions {
    pub timeout_secs: u64,
    pub buffered: bool,
    /// Use server-side prepared statements for bound queries.
    pub persistent: bool,
}

impl ExecOptions {
    pub fn for_backend(config: &BackendConfig) -> Self {
        Self {
            timeout_secs: config.query_timeout_secs,
            buffered: config.is_buffered(),
            persistent: !config.driver_options.emulate_prepares(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where a statement runs.
pub(crate) enum Target<'a> {
    Pool(&'a DbPool),
    Transaction(&'a mut DbTransaction),
}

impl Target<'_> {
    fn is_postgres(&self) -> bool {
        matches!(
            self,
            Target::Pool(DbPool::Postgres(_)) | Target::Transaction(DbTransaction::Postgres(_))
        )
    }
}

/// Result of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ExecSummary {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Call the same function in the driver submodule matching the target.
///
/// Pools are passed by reference; transactions pass their connection.
macro_rules! dispatch {
    ($target:expr, $func:ident($($arg:expr),* $(,)?)) => {
        match $target {
            Target::Pool(DbPool::MySql(p)) => mysql::$func(p, $($arg),*).await,
            Target::Pool(DbPool::Postgres(p)) => postgres::$func(p, $($arg),*).await,
            Target::Pool(DbPool::SQLite(p)) => sqlite::$func(p, $($arg),*).await,
            Target::Transaction(DbTransaction::MySql(tx)) => mysql::$func(&mut **tx, $($arg),*).await,
            Target::Transaction(DbTransaction::Postgres(tx)) => {
                postgres::$func(&mut **tx, $($arg),*).await
            }
            Target::Transaction(DbTransaction::SQLite(tx)) => sqlite::$func(&mut **tx, $($arg),*).await,
        }
    };
}

/// Run a row-returning statement.
pub(crate) async fn fetch_rows(
    target: Target<'_>,
    sql: &str,
    params: &[QueryParam],
    opts: &ExecOptions,
) -> DbResult<Vec<Row>> {
    debug!(
        sql = %sql,
        params = params.len(),
        buffered = opts.buffered,
        timeout_secs = opts.timeout_secs,
        "Executing query"
    );
    with_timeout("query execution", opts, async move {
        dispatch!(target, fetch_rows(sql, params, opts))
    })
    .await
}

/// Per-row consumer for streamed reads. An error stops the stream.
pub(crate) type RowCallback<'a> = dyn FnMut(Row) -> DbResult<()> + Send + 'a;

/// Stream a row-returning statement into `on_row`, one decoded row at a time,
/// regardless of the backend's buffering setting. Returns the row count.
pub(crate) async fn for_each_row(
    target: Target<'_>,
    sql: &str,
    params: &[QueryParam],
    opts: &ExecOptions,
    on_row: &mut RowCallback<'_>,
) -> DbResult<u64> {
    debug!(
        sql = %sql,
        params = params.len(),
        timeout_secs = opts.timeout_secs,
        "Streaming query"
    );
    with_timeout("query execution", opts, async move {
        dispatch!(target, for_each_row(sql, params, opts, on_row))
    })
    .await
}

/// Run a statement that returns no rows.
pub(crate) async fn execute(
    target: Target<'_>,
    sql: &str,
    params: &[QueryParam],
    opts: &ExecOptions,
) -> DbResult<ExecSummary> {
    debug!(
        sql = %sql,
        params = params.len(),
        timeout_secs = opts.timeout_secs,
        "Executing statement"
    );
    with_timeout("statement execution", opts, async move {
        dispatch!(target, execute(sql, params, opts))
    })
    .await
}

/// Run an INSERT and return the key it generated.
///
/// PostgreSQL has no session-level last insert id, so `RETURNING id` is
/// appended unless the statement already has a `RETURNING` clause.
pub(crate) async fn insert_get_id(
    target: Target<'_>,
    sql: &str,
    params: &[QueryParam],
    opts: &ExecOptions,
) -> DbResult<i64> {
    let sql = if target.is_postgres() {
        with_returning_id(sql)
    } else {
        Cow::Borrowed(sql)
    };
    debug!(sql = %sql, params = params.len(), "Executing insert for generated key");

    let sql = sql.as_ref();
    with_timeout("insert execution", opts, async move {
        dispatch!(target, insert_get_id(sql, params, opts))
    })
    .await
}

/// Run raw SQL on the target, bypassing classification and parameters.
///
/// Used for transaction control such as savepoints.
pub(crate) async fn raw(target: Target<'_>, sql: &str, opts: &ExecOptions) -> DbResult<()> {
    debug!(sql = %sql, "Executing raw statement");
    with_timeout("statement execution", opts, async move {
        dispatch!(target, execute(sql, &[], opts))?;
        Ok(())
    })
    .await
}

fn with_returning_id(sql: &str) -> Cow<'_, str> {
    if sql.to_lowercase().contains("returning") {
        Cow::Borrowed(sql)
    } else {
        let trimmed = sql.trim_end().trim_end_matches(';');
        Cow::Owned(format!("{} RETURNING id", trimmed))
    }
}

async fn with_timeout<T>(
    operation: &str,
    opts: &ExecOptions,
    work: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    match timeout(opts.timeout(), work).await {
        Ok(result) => result,
        Err(_) => Err(DbError::statement_timeout(operation, opts.timeout_secs)),
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// Statements without parameters run as raw SQL so that statements the server
// cannot prepare (DDL, procedures) still work.

mod mysql {
    use super::*;
    use crate::db::params::mysql_query;
    use sqlx::{Executor, MySql};

    pub async fn fetch_rows<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
    ) -> DbResult<Vec<Row>>
    where
        E: 'e + Executor<'e, Database = MySql>,
    {
        if opts.buffered {
            let rows = if params.is_empty() {
                executor.fetch_all(sql).await?
            } else {
                mysql_query(sql, params, opts.persistent)
                    .fetch_all(executor)
                    .await?
            };
            return Ok(rows.iter().map(RowToJson::to_row).collect());
        }

        let mut rows = Vec::new();
        for_each_row(executor, sql, params, opts, &mut |row| {
            rows.push(row);
            Ok(())
        })
        .await?;
        Ok(rows)
    }

    pub async fn for_each_row<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
        on_row: &mut RowCallback<'_>,
    ) -> DbResult<u64>
    where
        E: 'e + Executor<'e, Database = MySql>,
    {
        let mut stream = if params.is_empty() {
            executor.fetch(sql)
        } else {
            mysql_query(sql, params, opts.persistent).fetch(executor)
        };
        let mut count = 0;
        while let Some(row) = stream.try_next().await? {
            on_row(row.to_row())?;
            count += 1;
        }
        Ok(count)
    }

    pub async fn execute<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
    ) -> DbResult<ExecSummary>
    where
        E: 'e + Executor<'e, Database = MySql>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await?
        } else {
            mysql_query(sql, params, opts.persistent)
                .execute(executor)
                .await?
        };
        Ok(ExecSummary {
            rows_affected: result.rows_affected(),
            last_insert_id: i64::try_from(result.last_insert_id()).ok(),
        })
    }

    pub async fn insert_get_id<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
    ) -> DbResult<i64>
    where
        E: 'e + Executor<'e, Database = MySql>,
    {
        let summary = execute(executor, sql, params, opts).await?;
        summary
            .last_insert_id
            .ok_or_else(|| DbError::internal("Generated key does not fit in i64"))
    }
}

mod postgres {
    use super::*;
    use crate::db::params::postgres_query;
    use sqlx::{Executor, Postgres, Row as _};

    pub async fn fetch_rows<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
    ) -> DbResult<Vec<Row>>
    where
        E: 'e + Executor<'e, Database = Postgres>,
    {
        if opts.buffered {
            let rows = if params.is_empty() {
                executor.fetch_all(sql).await?
            } else {
                postgres_query(sql, params, opts.persistent)
                    .fetch_all(executor)
                    .await?
            };
            return Ok(rows.iter().map(RowToJson::to_row).collect());
        }

        let mut rows = Vec::new();
        for_each_row(executor, sql, params, opts, &mut |row| {
            rows.push(row);
            Ok(())
        })
        .await?;
        Ok(rows)
    }

    pub async fn for_each_row<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
        on_row: &mut RowCallback<'_>,
    ) -> DbResult<u64>
    where
        E: 'e + Executor<'e, Database = Postgres>,
    {
        let mut stream = if params.is_empty() {
            executor.fetch(sql)
        } else {
            postgres_query(sql, params, opts.persistent).fetch(executor)
        };
        let mut count = 0;
        while let Some(row) = stream.try_next().await? {
            on_row(row.to_row())?;
            count += 1;
        }
        Ok(count)
    }

    pub async fn execute<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
    ) -> DbResult<ExecSummary>
    where
        E: 'e + Executor<'e, Database = Postgres>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await?
        } else {
            postgres_query(sql, params, opts.persistent)
                .execute(executor)
                .await?
        };
        Ok(ExecSummary {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    pub async fn insert_get_id<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
    ) -> DbResult<i64>
    where
        E: 'e + Executor<'e, Database = Postgres>,
    {
        let row = if params.is_empty() {
            executor.fetch_one(sql).await?
        } else {
            postgres_query(sql, params, opts.persistent)
                .fetch_one(executor)
                .await?
        };
        // SERIAL is int4, BIGSERIAL is int8
        match row.try_get::<i64, _>(0) {
            Ok(id) => Ok(id),
            Err(_) => Ok(row.try_get::<i32, _>(0).map(i64::from)?),
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::sqlite_query;
    use sqlx::{Executor, Sqlite};

    pub async fn fetch_rows<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
    ) -> DbResult<Vec<Row>>
    where
        E: 'e + Executor<'e, Database = Sqlite>,
    {
        if opts.buffered {
            let rows = if params.is_empty() {
                executor.fetch_all(sql).await?
            } else {
                sqlite_query(sql, params, opts.persistent)
                    .fetch_all(executor)
                    .await?
            };
            return Ok(rows.iter().map(RowToJson::to_row).collect());
        }

        let mut rows = Vec::new();
        for_each_row(executor, sql, params, opts, &mut |row| {
            rows.push(row);
            Ok(())
        })
        .await?;
        Ok(rows)
    }

    pub async fn for_each_row<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
        on_row: &mut RowCallback<'_>,
    ) -> DbResult<u64>
    where
        E: 'e + Executor<'e, Database = Sqlite>,
    {
        let mut stream = if params.is_empty() {
            executor.fetch(sql)
        } else {
            sqlite_query(sql, params, opts.persistent).fetch(executor)
        };
        let mut count = 0;
        while let Some(row) = stream.try_next().await? {
            on_row(row.to_row())?;
            count += 1;
        }
        Ok(count)
    }

    pub async fn execute<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
    ) -> DbResult<ExecSummary>
    where
        E: 'e + Executor<'e, Database = Sqlite>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await?
        } else {
            sqlite_query(sql, params, opts.persistent)
                .execute(executor)
                .await?
        };
        Ok(ExecSummary {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_rowid()),
        })
    }

    pub async fn insert_get_id<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        opts: &ExecOptions,
    ) -> DbResult<i64>
    where
        E: 'e + Executor<'e, Database = Sqlite>,
    {
        let summary = execute(executor, sql, params, opts).await?;
        Ok(summary.last_insert_id.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DriverKind;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    fn opts() -> ExecOptions {
        ExecOptions {
            timeout_secs: 5,
            buffered: true,
            persistent: true,
        }
    }

    async fn memory_pool() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let pool = DbPool::SQLite(pool);
        execute(
            Target::Pool(&pool),
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL)",
            &[],
            &opts(),
        )
        .await
        .unwrap();
        pool
    }

    #[test]
    fn test_options_for_backend() {
        let config = BackendConfig::builder("testing", DriverKind::InMemory)
            .query_timeout_secs(7)
            .build()
            .unwrap();
        let opts = ExecOptions::for_backend(&config);
        assert_eq!(opts.timeout_secs, 7);
        assert!(opts.buffered);
        assert!(opts.persistent);
    }

    #[test]
    fn test_with_returning_id() {
        assert_eq!(
            with_returning_id("INSERT INTO t (a) VALUES ($1);"),
            "INSERT INTO t (a) VALUES ($1) RETURNING id"
        );
        assert_eq!(
            with_returning_id("INSERT INTO t (a) VALUES ($1) RETURNING uid"),
            "INSERT INTO t (a) VALUES ($1) RETURNING uid"
        );
    }

    #[tokio::test]
    async fn test_insert_and_fetch() {
        let pool = memory_pool().await;
        let id = insert_get_id(
            Target::Pool(&pool),
            "INSERT INTO users (name, score) VALUES (?, ?)",
            &["alice".into(), 9.5.into()],
            &opts(),
        )
        .await
        .unwrap();
        assert_eq!(id, 1);

        let rows = fetch_rows(
            Target::Pool(&pool),
            "SELECT id, name, score FROM users WHERE id = ?",
            &[id.into()],
            &opts(),
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("alice"));
        assert_eq!(rows[0]["score"], json!(9.5));
        let columns: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(columns, ["id", "name", "score"]);
    }

    #[tokio::test]
    async fn test_streamed_fetch_matches_buffered() {
        let pool = memory_pool().await;
        for name in ["a", "b", "c"] {
            execute(
                Target::Pool(&pool),
                "INSERT INTO users (name) VALUES (?)",
                &[name.into()],
                &opts(),
            )
            .await
            .unwrap();
        }

        let streamed = ExecOptions {
            buffered: false,
            ..opts()
        };
        let sql = "SELECT name FROM users ORDER BY id";
        let a = fetch_rows(Target::Pool(&pool), sql, &[], &opts()).await.unwrap();
        let b = fetch_rows(Target::Pool(&pool), sql, &[], &streamed).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[tokio::test]
    async fn test_for_each_row_stops_on_callback_error() {
        let pool = memory_pool().await;
        for name in ["a", "b", "c"] {
            execute(
                Target::Pool(&pool),
                "INSERT INTO users (name) VALUES (?)",
                &[name.into()],
                &opts(),
            )
            .await
            .unwrap();
        }

        let mut seen = Vec::new();
        let count = for_each_row(
            Target::Pool(&pool),
            "SELECT name FROM users ORDER BY id",
            &[],
            &opts(),
            &mut |row| {
                seen.push(row["name"].clone());
                Ok(())
            },
        )
        .await
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(seen, [json!("a"), json!("b"), json!("c")]);

        let mut calls = 0;
        let err = for_each_row(
            Target::Pool(&pool),
            "SELECT name FROM users ORDER BY id",
            &[],
            &opts(),
            &mut |_| {
                calls += 1;
                Err(DbError::internal("consumer full"))
            },
        )
        .await
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.to_string().contains("consumer full"));
    }

    #[tokio::test]
    async fn test_execute_reports_affected_rows() {
        let pool = memory_pool().await;
        for name in ["a", "b"] {
            execute(
                Target::Pool(&pool),
                "INSERT INTO users (name) VALUES (?)",
                &[name.into()],
                &opts(),
            )
            .await
            .unwrap();
        }
        let summary = execute(
            Target::Pool(&pool),
            "UPDATE users SET score = 1.0",
            &[],
            &opts(),
        )
        .await
        .unwrap();
        assert_eq!(summary.rows_affected, 2);
    }

    #[tokio::test]
    async fn test_transaction_target() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.unwrap();
        execute(
            Target::Transaction(&mut tx),
            "INSERT INTO users (name) VALUES (?)",
            &["bob".into()],
            &opts(),
        )
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        let rows = fetch_rows(Target::Pool(&pool), "SELECT * FROM users", &[], &opts())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_driver_error_is_query_error() {
        let pool = memory_pool().await;
        let err = fetch_rows(Target::Pool(&pool), "SELECT * FROM missing", &[], &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_query_error() {
        let opts = ExecOptions {
            timeout_secs: 1,
            ..opts()
        };
        let err = with_timeout("query execution", &opts, async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));
        assert!(err.to_string().contains("exceeded 1s"));
    }
}
