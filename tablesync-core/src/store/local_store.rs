use sqlx::{SqliteConnection, SqlitePool};

use super::{decode_fields, encode_fields};
use crate::models::{Row, Version};

/// Durable cache of rows, keyed by table name and row id.
///
/// The `*_in` variants run on a caller supplied connection so they can join
/// a transaction; the others autocommit.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct RowRecord {
    id: String,
    version: Option<String>,
    fields: String,
}

impl RowRecord {
    fn into_row(self) -> Result<Row, sqlx::Error> {
        Ok(Row {
            id: self.id,
            version: self.version.map(Version::new),
            fields: decode_fields(&self.fields)?,
        })
    }
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, table: &str, id: &str) -> Result<Option<Row>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.get_in(&mut conn, table, id).await
    }

    pub async fn get_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        id: &str,
    ) -> Result<Option<Row>, sqlx::Error> {
        let record: Option<RowRecord> = sqlx::query_as(
            "SELECT id, version, fields FROM rows WHERE table_name = ? AND id = ?",
        )
        .bind(table)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        record.map(RowRecord::into_row).transpose()
    }

    /// All rows of `table` accepted by `predicate`, ordered by id.
    pub async fn list<F>(&self, table: &str, predicate: F) -> Result<Vec<Row>, sqlx::Error>
    where
        F: Fn(&Row) -> bool,
    {
        let records: Vec<RowRecord> =
            sqlx::query_as("SELECT id, version, fields FROM rows WHERE table_name = ? ORDER BY id")
                .bind(table)
                .fetch_all(&self.pool)
                .await?;

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let row = record.into_row()?;
            if predicate(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub async fn upsert(&self, table: &str, row: &Row) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.upsert_in(&mut conn, table, row).await
    }

    pub async fn upsert_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        row: &Row,
    ) -> Result<(), sqlx::Error> {
        let fields = encode_fields(&row.fields)?;

        sqlx::query(
            r#"
            INSERT INTO rows (table_name, id, version, fields)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (table_name, id) DO UPDATE SET
                version = excluded.version,
                fields = excluded.fields
            "#,
        )
        .bind(table)
        .bind(&row.id)
        .bind(row.version.as_ref().map(Version::as_str))
        .bind(&fields)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Records a server-confirmed version without touching the payload.
    pub async fn set_version_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        id: &str,
        version: Option<&Version>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE rows SET version = ? WHERE table_name = ? AND id = ?")
            .bind(version.map(Version::as_str))
            .bind(table)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Removes a row. Returns false when there was nothing to remove.
    pub async fn delete(&self, table: &str, id: &str) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.delete_in(&mut conn, table, id).await
    }

    pub async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM rows WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drops every local row of a table. Returns the number removed.
    pub async fn purge_table_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM rows WHERE table_name = ?")
            .bind(table)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payload;
    use crate::store::init_db;
    use tempfile::TempDir;

    struct TestContext {
        store: LocalStore,
        _temp_dir: TempDir, // Keep alive for duration of test
    }

    async fn setup_store() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(temp_dir.path().join("test.db")).await.unwrap();
        TestContext {
            store: LocalStore::new(pool),
            _temp_dir: temp_dir,
        }
    }

    fn row(id: &str, name: &str) -> Row {
        Row::new(id, Payload::new()).with_field("name", name)
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        store.upsert("items", &row("1", "24")).await.unwrap();
        let fetched = store.get("items", "1").await.unwrap().unwrap();
        assert_eq!(fetched.field("name").unwrap(), "24");
        assert_eq!(fetched.version, None);

        let updated = row("1", "42").with_version(Version::new("v1"));
        store.upsert("items", &updated).await.unwrap();
        let fetched = store.get("items", "1").await.unwrap().unwrap();
        assert_eq!(fetched, updated);
    }

    #[tokio::test]
    async fn test_rows_are_scoped_by_table() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        store.upsert("items", &row("1", "a")).await.unwrap();
        assert!(store.get("other", "1").await.unwrap().is_none());
        assert!(store.list("other", |_| true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_with_predicate_sorted_by_id() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        store.upsert("items", &row("c", "keep")).await.unwrap();
        store.upsert("items", &row("a", "keep")).await.unwrap();
        store.upsert("items", &row("b", "drop")).await.unwrap();

        let rows = store
            .list("items", |r| r.field("name").and_then(|v| v.as_str()) == Some("keep"))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_delete_missing_row_is_noop() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        assert!(!store.delete("items", "nope").await.unwrap());

        store.upsert("items", &row("1", "x")).await.unwrap();
        assert!(store.delete("items", "1").await.unwrap());
        assert!(store.get("items", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_version_keeps_fields() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        store.upsert("items", &row("1", "local")).await.unwrap();
        let mut conn = ctx.store.pool.acquire().await.unwrap();
        store
            .set_version_in(&mut conn, "items", "1", Some(&Version::new("v9")))
            .await
            .unwrap();

        let fetched = store.get("items", "1").await.unwrap().unwrap();
        assert_eq!(fetched.version, Some(Version::new("v9")));
        assert_eq!(fetched.field("name").unwrap(), "local");
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let pool = init_db(&db_path).await.unwrap();
        LocalStore::new(pool.clone())
            .upsert("items", &row("1", "durable"))
            .await
            .unwrap();
        pool.close().await;

        let pool = init_db(&db_path).await.unwrap();
        let fetched = LocalStore::new(pool).get("items", "1").await.unwrap();
        assert_eq!(fetched.unwrap().field("name").unwrap(), "durable");
    }
}
