//! Transaction coordinator.
//!
//! [`ConnectionManager::transaction`] runs a unit of work on one dedicated pooled
//! connection: commit when the work returns `Ok`, full rollback when it returns
//! `Err`. A panic or cancellation drops the driver transaction, which rolls back.
//!
//! Nesting is explicit. Inside a scope, [`TransactionScope::savepoint`] opens a
//! savepoint. Calling `transaction` again for the same connection from the same
//! task fails fast with [`DbError::NestedTransaction`] instead of waiting for a
//! second pooled connection.

use crate::db::executor::{self, Target};
use crate::db::instrumentation::QueryLogger;
use crate::db::manager::ConnectionManager;
use crate::db::pool::ConnectionHandle;
use crate::db::router::Router;
use crate::error::{DbError, DbResult};
use crate::models::{QueryOutcome, QueryParam, Row, StatementKind};
use futures_util::future::BoxFuture;
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

tokio::task_local! {
    /// Connections with a transaction open in the current task.
    static ACTIVE_TRANSACTIONS: HashSet<String>;
}

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.commit().await.map_err(DbError::from),
        }
    }

    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.rollback().await.map_err(DbError::from),
        }
    }
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let driver = match self {
            DbTransaction::MySql(_) => "MySql",
            DbTransaction::Postgres(_) => "Postgres",
            DbTransaction::SQLite(_) => "SQLite",
        };
        f.debug_tuple("DbTransaction").field(&driver).finish()
    }
}

/// Operations available inside a transaction. All of them run on the
/// transaction's connection and are logged like pool-level statements.
#[derive(Debug)]
pub struct TransactionScope {
    id: String,
    handle: Arc<ConnectionHandle>,
    logger: Arc<QueryLogger>,
    tx: DbTransaction,
    savepoints: u32,
}

impl TransactionScope {
    fn new(handle: Arc<ConnectionHandle>, logger: Arc<QueryLogger>, tx: DbTransaction) -> Self {
        Self {
            id: format!("tx_{}", uuid::Uuid::new_v4().simple()),
            handle,
            logger,
            tx,
            savepoints: 0,
        }
    }

    /// Identifier used in log events, `tx_<uuid>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the connection this transaction runs on.
    pub fn connection(&self) -> &str {
        self.handle.name()
    }

    /// Savepoints currently open.
    pub fn savepoint_depth(&self) -> u32 {
        self.savepoints
    }

    fn split(&mut self) -> (Router<'_>, Target<'_>) {
        (
            Router::new(&self.handle, &self.logger),
            Target::Transaction(&mut self.tx),
        )
    }

    pub async fn execute(&mut self, sql: &str, bindings: &[QueryParam]) -> DbResult<QueryOutcome> {
        let (router, target) = self.split();
        router.execute(target, sql, bindings).await
    }

    pub async fn select(&mut self, sql: &str, bindings: &[QueryParam]) -> DbResult<Vec<Row>> {
        let (router, target) = self.split();
        router.select(target, sql, bindings).await
    }

    pub async fn insert(&mut self, sql: &str, bindings: &[QueryParam]) -> DbResult<u64> {
        let (router, target) = self.split();
        router
            .affecting(target, StatementKind::Write, sql, bindings)
            .await
    }

    pub async fn update(&mut self, sql: &str, bindings: &[QueryParam]) -> DbResult<u64> {
        let (router, target) = self.split();
        router
            .affecting(target, StatementKind::Write, sql, bindings)
            .await
    }

    pub async fn delete(&mut self, sql: &str, bindings: &[QueryParam]) -> DbResult<u64> {
        let (router, target) = self.split();
        router
            .affecting(target, StatementKind::Write, sql, bindings)
            .await
    }

    pub async fn statement(&mut self, sql: &str, bindings: &[QueryParam]) -> DbResult<u64> {
        let (router, target) = self.split();
        router
            .affecting(target, StatementKind::Other, sql, bindings)
            .await
    }

    pub async fn insert_get_id(&mut self, sql: &str, bindings: &[QueryParam]) -> DbResult<i64> {
        let (router, target) = self.split();
        router.insert_get_id(target, sql, bindings).await
    }

    /// Run `work` inside a savepoint.
    ///
    /// `Ok` releases the savepoint; `Err` rolls back to it and returns the error,
    /// leaving earlier work in the enclosing transaction intact.
    pub async fn savepoint<T, E, F>(&mut self, work: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope) -> BoxFuture<'s, Result<T, E>> + Send,
        E: From<DbError>,
    {
        let name = format!("sp_{}", self.savepoints + 1);
        self.control(&format!("SAVEPOINT {}", name)).await?;
        self.savepoints += 1;
        debug!(transaction_id = %self.id, savepoint = %name, "Savepoint created");

        let result = work(self).await;
        self.savepoints -= 1;

        match result {
            Ok(value) => {
                self.control(&format!("RELEASE SAVEPOINT {}", name)).await?;
                Ok(value)
            }
            Err(err) => {
                self.control(&format!("ROLLBACK TO SAVEPOINT {}", name))
                    .await?;
                self.control(&format!("RELEASE SAVEPOINT {}", name)).await?;
                debug!(transaction_id = %self.id, savepoint = %name, "Rolled back to savepoint");
                Err(err)
            }
        }
    }

    /// Transaction control statements bypass routing and the query log.
    async fn control(&mut self, sql: &str) -> DbResult<()> {
        let (router, target) = self.split();
        let opts = *router.options();
        executor::raw(target, sql, &opts).await
    }
}

impl ConnectionManager {
    /// Run `work` atomically on the connection `name` (the default when `None`).
    ///
    /// The work's error is returned unchanged after a full rollback.
    pub async fn transaction<T, E, F>(&self, name: Option<&str>, work: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope) -> BoxFuture<'s, Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Send,
    {
        let handle = self.connection(name).await?;
        let connection = handle.name().to_string();

        let mut active = ACTIVE_TRANSACTIONS
            .try_with(Clone::clone)
            .unwrap_or_default();
        if !active.insert(connection.clone()) {
            warn!(connection = %connection, "Nested transaction rejected");
            return Err(DbError::nested_transaction(connection).into());
        }

        let _depth = handle.enter_transaction();
        let tx = handle.pool().begin().await?;
        let mut scope = TransactionScope::new(Arc::clone(&handle), Arc::clone(self.logger_arc()), tx);
        info!(
            transaction_id = %scope.id,
            connection = %connection,
            depth = handle.transaction_depth(),
            "Transaction started"
        );

        let result = ACTIVE_TRANSACTIONS.scope(active, work(&mut scope)).await;
        let TransactionScope { id, tx, .. } = scope;

        match result {
            Ok(value) => {
                tx.commit().await?;
                info!(transaction_id = %id, connection = %connection, "Transaction committed");
                Ok(value)
            }
            Err(err) => {
                match tx.rollback().await {
                    Ok(()) => {
                        info!(transaction_id = %id, connection = %connection, "Transaction rolled back")
                    }
                    Err(e) => {
                        warn!(transaction_id = %id, connection = %connection, error = %e, "Rollback failed")
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryLogConfig;
    use crate::db::registry::BackendRegistry;
    use crate::models::{BackendConfig, DriverKind};
    use futures_util::FutureExt;

    async fn manager() -> ConnectionManager {
        let registry = BackendRegistry::builder()
            .backend(
                BackendConfig::builder("testing", DriverKind::InMemory)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let manager = ConnectionManager::with_sqlx(registry, QueryLogConfig::default());
        manager
            .statement(
                "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL)",
                &[],
                None,
            )
            .await
            .unwrap();
        manager
    }

    async fn owners(manager: &ConnectionManager) -> Vec<String> {
        manager
            .select("SELECT owner FROM accounts ORDER BY id", &[], None)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|row| row["owner"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_scope_id_format() {
        let manager = manager().await;
        let id = manager
            .transaction(None, |tx| {
                async move { Ok::<_, DbError>(tx.id().to_string()) }.boxed()
            })
            .await
            .unwrap();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_outer_work() {
        let manager = manager().await;
        manager
            .transaction(None, |tx| {
                async move {
                    tx.insert("INSERT INTO accounts (owner) VALUES (?)", &["outer".into()])
                        .await?;
                    let inner: Result<(), DbError> = tx
                        .savepoint(|tx| {
                            async move {
                                assert_eq!(tx.savepoint_depth(), 1);
                                tx.insert(
                                    "INSERT INTO accounts (owner) VALUES (?)",
                                    &["inner".into()],
                                )
                                .await?;
                                Err(DbError::internal("abandon inner work"))
                            }
                            .boxed()
                        })
                        .await;
                    assert!(inner.is_err());
                    assert_eq!(tx.savepoint_depth(), 0);
                    Ok::<_, DbError>(())
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(owners(&manager).await, ["outer"]);
    }

    #[tokio::test]
    async fn test_depth_tracked_during_work() {
        let manager = manager().await;
        let handle = manager.connection(None).await.unwrap();
        let seen = manager
            .transaction(None, |_tx| {
                let handle = Arc::clone(&handle);
                async move { Ok::<_, DbError>(handle.transaction_depth()) }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(handle.transaction_depth(), 0);
    }
}
