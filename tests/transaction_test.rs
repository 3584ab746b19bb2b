//! Integration tests for the transaction coordinator.

use futures_util::FutureExt;
use multidb_manager::DbError;
use multidb_manager::config::QueryLogConfig;
use multidb_manager::db::{BackendRegistry, ConnectionManager};
use multidb_manager::models::{BackendConfig, DriverKind};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

/// Error type of the caller's unit of work.
#[derive(Debug)]
enum TransferError {
    Db(DbError),
    InsufficientFunds,
}

impl From<DbError> for TransferError {
    fn from(e: DbError) -> Self {
        Self::Db(e)
    }
}

fn manager(path: &Path) -> ConnectionManager {
    let registry = BackendRegistry::builder()
        .backend(
            BackendConfig::builder("sqlite", DriverKind::Sqlite)
                .database(path.to_string_lossy())
                .build()
                .unwrap(),
        )
        .backend(
            BackendConfig::builder("testing", DriverKind::InMemory)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    ConnectionManager::with_sqlx(registry, QueryLogConfig::default())
}

async fn setup(dir: &TempDir) -> ConnectionManager {
    let manager = manager(&dir.path().join("bank.db"));
    manager
        .statement(
            "CREATE TABLE ledger (id INTEGER PRIMARY KEY, account TEXT NOT NULL, amount INTEGER NOT NULL)",
            &[],
            None,
        )
        .await
        .unwrap();
    manager
}

async fn accounts(manager: &ConnectionManager) -> Vec<String> {
    manager
        .select("SELECT account FROM ledger ORDER BY id", &[], None)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row["account"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_commit_makes_all_writes_visible() {
    let dir = TempDir::new().unwrap();
    let manager = setup(&dir).await;

    let written = manager
        .transaction(None, |tx| {
            async move {
                tx.insert("INSERT INTO ledger (account, amount) VALUES (?, ?)", &["A".into(), (-10).into()])
                    .await?;
                tx.insert("INSERT INTO ledger (account, amount) VALUES (?, ?)", &["B".into(), 10.into()])
                    .await?;
                let rows = tx.select("SELECT COUNT(*) AS n FROM ledger", &[]).await?;
                Ok::<_, DbError>(rows[0]["n"].clone())
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(written, json!(2));
    assert_eq!(accounts(&manager).await, ["A", "B"]);
}

#[tokio::test]
async fn test_error_rolls_back_everything_and_is_returned() {
    let dir = TempDir::new().unwrap();
    let manager = setup(&dir).await;

    let err = manager
        .transaction(None, |tx| {
            async move {
                tx.insert("INSERT INTO ledger (account, amount) VALUES (?, ?)", &["A".into(), (-10).into()])
                    .await?;
                Err::<(), _>(TransferError::InsufficientFunds)
            }
            .boxed()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::InsufficientFunds));
    assert!(accounts(&manager).await.is_empty());
}

#[tokio::test]
async fn test_driver_error_inside_work_rolls_back() {
    let dir = TempDir::new().unwrap();
    let manager = setup(&dir).await;

    let err = manager
        .transaction(None, |tx| {
            async move {
                tx.insert("INSERT INTO ledger (account, amount) VALUES (?, ?)", &["A".into(), 1.into()])
                    .await?;
                tx.insert("INSERT INTO ledger (account, amount) VALUES (?, NULL)", &["B".into()])
                    .await?;
                Ok::<_, TransferError>(())
            }
            .boxed()
        })
        .await
        .unwrap_err();

    match err {
        TransferError::Db(e) => assert!(e.to_string().contains("NOT NULL")),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(accounts(&manager).await.is_empty());
}

#[tokio::test]
async fn test_panic_in_work_rolls_back() {
    let dir = TempDir::new().unwrap();
    let manager = setup(&dir).await;

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .transaction(None, |tx| {
                    async move {
                        tx.insert("INSERT INTO ledger (account, amount) VALUES (?, ?)", &["A".into(), 1.into()])
                            .await?;
                        if tx.connection() == "sqlite" {
                            panic!("worker crashed");
                        }
                        Ok::<_, DbError>(())
                    }
                    .boxed()
                })
                .await
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    assert!(accounts(&manager).await.is_empty());
    let handle = manager.connection(None).await.unwrap();
    assert_eq!(handle.transaction_depth(), 0);
}

#[tokio::test]
async fn test_nested_transaction_on_same_connection_fails_fast() {
    let dir = TempDir::new().unwrap();
    let manager = setup(&dir).await;

    let inner = manager
        .transaction(None, |tx| {
            let manager = manager.clone();
            async move {
                tx.insert("INSERT INTO ledger (account, amount) VALUES (?, ?)", &["A".into(), 1.into()])
                    .await?;
                let nested = manager
                    .transaction(Some("sqlite"), |_tx| async { Ok::<_, DbError>(()) }.boxed())
                    .await;
                Ok::<_, DbError>(nested)
            }
            .boxed()
        })
        .await
        .unwrap();

    assert!(matches!(inner, Err(DbError::NestedTransaction { ref connection }) if connection == "sqlite"));
    // The outer transaction still committed
    assert_eq!(accounts(&manager).await, ["A"]);
}

#[tokio::test]
async fn test_transactions_on_different_connections_are_independent() {
    let dir = TempDir::new().unwrap();
    let manager = setup(&dir).await;
    manager
        .statement("CREATE TABLE audit (note TEXT)", &[], Some("testing"))
        .await
        .unwrap();

    manager
        .transaction(None, |tx| {
            let manager = manager.clone();
            async move {
                tx.insert("INSERT INTO ledger (account, amount) VALUES (?, ?)", &["A".into(), 1.into()])
                    .await?;
                manager
                    .transaction(Some("testing"), |audit| {
                        async move {
                            audit
                                .insert("INSERT INTO audit (note) VALUES (?)", &["moved 1".into()])
                                .await?;
                            Ok::<_, DbError>(())
                        }
                        .boxed()
                    })
                    .await?;
                Ok::<_, DbError>(())
            }
            .boxed()
        })
        .await
        .unwrap();

    let notes = manager
        .select("SELECT note FROM audit", &[], Some("testing"))
        .await
        .unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(accounts(&manager).await, ["A"]);
}

#[tokio::test]
async fn test_sequential_transactions_reuse_the_name() {
    let dir = TempDir::new().unwrap();
    let manager = setup(&dir).await;

    for account in ["A", "B"] {
        manager
            .transaction(None, |tx| {
                async move {
                    tx.insert("INSERT INTO ledger (account, amount) VALUES (?, 0)", &[account.into()])
                        .await?;
                    Ok::<_, DbError>(())
                }
                .boxed()
            })
            .await
            .unwrap();
    }
    assert_eq!(accounts(&manager).await, ["A", "B"]);
}

#[tokio::test]
async fn test_savepoint_inside_transaction() {
    let dir = TempDir::new().unwrap();
    let manager = setup(&dir).await;

    manager
        .transaction(None, |tx| {
            async move {
                tx.insert("INSERT INTO ledger (account, amount) VALUES ('A', 1)", &[])
                    .await?;
                tx.savepoint(|tx| {
                    async move {
                        tx.insert("INSERT INTO ledger (account, amount) VALUES ('B', 1)", &[])
                            .await?;
                        Ok::<_, DbError>(())
                    }
                    .boxed()
                })
                .await?;
                let failed: Result<(), TransferError> = tx
                    .savepoint(|tx| {
                        async move {
                            tx.insert("INSERT INTO ledger (account, amount) VALUES ('C', 1)", &[])
                                .await?;
                            Err(TransferError::InsufficientFunds)
                        }
                        .boxed()
                    })
                    .await;
                assert!(failed.is_err());
                Ok::<_, DbError>(())
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(accounts(&manager).await, ["A", "B"]);
}
