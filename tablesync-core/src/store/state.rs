use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

const CLIENT_SCOPE: &str = "client";
const CLIENT_ID_KEY: &str = "id";
const PULL_MARK_KEY: &str = "updatedSince";

/// Small key/value bookkeeping next to the rows: client identity and
/// per-table pull high-water marks.
#[derive(Debug, Clone)]
pub struct SyncState {
    pool: SqlitePool,
}

impl SyncState {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT value FROM sync_state WHERE scope = ? AND key = ?")
            .bind(scope)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
    }

    async fn set_in(
        &self,
        conn: &mut SqliteConnection,
        scope: &str,
        key: &str,
        value: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (scope, key, value) VALUES (?, ?, ?)
            ON CONFLICT (scope, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Stable identifier of this local store, created on first use.
    ///
    /// Prefixes idempotency keys so two clients never collide.
    pub async fn client_id(&self) -> Result<String, sqlx::Error> {
        if let Some(id) = self.get(CLIENT_SCOPE, CLIENT_ID_KEY).await? {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT OR IGNORE INTO sync_state (scope, key, value) VALUES (?, ?, ?)")
            .bind(CLIENT_SCOPE)
            .bind(CLIENT_ID_KEY)
            .bind(&id)
            .execute(&self.pool)
            .await?;

        // Another connection may have won the race
        self.get(CLIENT_SCOPE, CLIENT_ID_KEY)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn pull_mark(&self, table: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let Some(raw) = self.get(table, PULL_MARK_KEY).await? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))
    }

    pub async fn set_pull_mark_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        mark: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        self.set_in(conn, table, PULL_MARK_KEY, &mark.to_rfc3339())
            .await
    }

    pub async fn clear_pull_mark_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM sync_state WHERE scope = ? AND key = ?")
            .bind(table)
            .bind(PULL_MARK_KEY)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
