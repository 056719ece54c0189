//! Durable local state: rows, pending operations and sync bookkeeping.
//!
//! Everything lives in one SQLite database so that a row write and its
//! operation log entry can commit in the same transaction.
//!
//! ```text
//! rows        (table_name, id) -> version, fields
//! operations  seq -> table_name, row_id, kind, fields, revision
//! sync_state  (scope, key) -> value
//! ```

mod local_store;
mod oplog;
mod state;

pub use local_store::LocalStore;
pub use oplog::{Enqueued, OperationLog};
pub use state::SyncState;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;

/// Open (creating if needed) the local database and run migrations.
pub async fn init_db(path: impl AsRef<Path>) -> Result<SqlitePool, sqlx::Error> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    tracing::debug!("Opened local store at {}", path.display());
    Ok(pool)
}

pub(crate) fn encode_fields(fields: &crate::models::Payload) -> Result<String, sqlx::Error> {
    serde_json::to_string(fields).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

pub(crate) fn decode_fields(raw: &str) -> Result<crate::models::Payload, sqlx::Error> {
    serde_json::from_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_init_db_creates_tables() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("local.db");

        let pool = init_db(&db_path).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(table_names, vec!["operations", "rows", "sync_state"]);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_init_db_is_reentrant() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("local.db");

        let pool = init_db(&db_path).await.unwrap();
        pool.close().await;

        // Reopening runs migrations against an already migrated database
        init_db(&db_path).await.unwrap();
    }
}
