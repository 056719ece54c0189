use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;

use super::{decode_fields, encode_fields};
use crate::models::{Attempt, Operation, OperationKind, Payload};

/// Durable, ordered queue of pending mutations.
///
/// Holds at most one entry per row: a later mutation on a row that already
/// has a pending entry is folded into it (see [`OperationLog::enqueue_in`]).
#[derive(Debug, Clone)]
pub struct OperationLog {
    pool: SqlitePool,
}

/// What `enqueue_in` did with a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new entry was appended with this sequence number.
    Appended(i64),
    /// Folded into the existing entry with this sequence number.
    Coalesced(i64),
    /// A delete cancelled an insert the server never saw; the entry was removed.
    Cancelled(i64),
}

impl Enqueued {
    pub fn seq(&self) -> i64 {
        match self {
            Enqueued::Appended(seq) | Enqueued::Coalesced(seq) | Enqueued::Cancelled(seq) => *seq,
        }
    }
}

const SELECT_OPERATION: &str = "SELECT seq, table_name, row_id, kind, fields, revision, \
     enqueued_at, attempt_kind, attempt_revision FROM operations";

#[derive(sqlx::FromRow)]
struct OperationRecord {
    seq: i64,
    table_name: String,
    row_id: String,
    kind: String,
    fields: String,
    revision: i64,
    enqueued_at: String,
    attempt_kind: Option<String>,
    attempt_revision: Option<i64>,
}

impl OperationRecord {
    fn into_operation(self) -> Result<Operation, sqlx::Error> {
        let kind = parse_kind(&self.kind)?;
        let attempt = match (self.attempt_kind, self.attempt_revision) {
            (Some(kind), Some(revision)) => Some(Attempt {
                kind: parse_kind(&kind)?,
                revision,
            }),
            _ => None,
        };
        let enqueued_at = DateTime::parse_from_rfc3339(&self.enqueued_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Operation {
            seq: self.seq,
            table: self.table_name,
            row_id: self.row_id,
            kind,
            fields: decode_fields(&self.fields)?,
            revision: self.revision,
            enqueued_at,
            attempt,
        })
    }
}

fn parse_kind(kind: &str) -> Result<OperationKind, sqlx::Error> {
    kind.parse::<OperationKind>()
        .map_err(|e| sqlx::Error::Decode(e.into()))
}

impl OperationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a mutation of `row_id`, coalescing with its pending entry.
    ///
    /// | pending  | new            | result                                   |
    /// |----------|----------------|------------------------------------------|
    /// | none     | any            | appended                                 |
    /// | insert   | insert/update  | insert with the new payload              |
    /// | update   | insert/update  | update with the new payload              |
    /// | delete   | insert/update  | update with the new payload              |
    /// | insert   | delete         | cancelled, or delete if it may have been |
    /// |          |                | delivered                                |
    /// | update   | delete         | delete                                   |
    /// | delete   | delete         | unchanged                                |
    ///
    /// Coalescing keeps the earliest sequence number and bumps the revision.
    /// `in_flight` is the sequence number the sync engine is currently sending;
    /// an insert with an unconfirmed [`Attempt`] counts as possibly delivered.
    pub async fn enqueue_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        row_id: &str,
        kind: OperationKind,
        fields: &Payload,
        in_flight: Option<i64>,
    ) -> Result<Enqueued, sqlx::Error> {
        let Some(pending) = self.pending_for_in(conn, table, row_id).await? else {
            let seq = self.append_in(conn, table, row_id, kind, fields).await?;
            return Ok(Enqueued::Appended(seq));
        };

        let merged = match (pending.kind, kind) {
            (OperationKind::Delete, OperationKind::Delete) => {
                return Ok(Enqueued::Coalesced(pending.seq));
            }
            (OperationKind::Insert, OperationKind::Delete)
                if in_flight != Some(pending.seq) && pending.attempt.is_none() =>
            {
                self.discard_in(conn, pending.seq).await?;
                return Ok(Enqueued::Cancelled(pending.seq));
            }
            (_, OperationKind::Delete) => OperationKind::Delete,
            (OperationKind::Insert, _) => OperationKind::Insert,
            (_, _) => OperationKind::Update,
        };

        self.rewrite_in(conn, pending.seq, merged, fields).await?;
        Ok(Enqueued::Coalesced(pending.seq))
    }

    async fn append_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        row_id: &str,
        kind: OperationKind,
        fields: &Payload,
    ) -> Result<i64, sqlx::Error> {
        let fields = encode_fields(fields)?;
        let result = sqlx::query(
            r#"
            INSERT INTO operations (table_name, row_id, kind, fields, revision, enqueued_at)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(table)
        .bind(row_id)
        .bind(kind.as_str())
        .bind(&fields)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Replaces kind and payload of an entry and bumps its revision.
    pub async fn rewrite_in(
        &self,
        conn: &mut SqliteConnection,
        seq: i64,
        kind: OperationKind,
        fields: &Payload,
    ) -> Result<bool, sqlx::Error> {
        let fields = encode_fields(fields)?;
        let result = sqlx::query(
            "UPDATE operations SET kind = ?, fields = ?, revision = revision + 1 WHERE seq = ?",
        )
        .bind(kind.as_str())
        .bind(&fields)
        .bind(seq)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Changes only the kind of an entry, leaving its revision alone.
    pub async fn set_kind_in(
        &self,
        conn: &mut SqliteConnection,
        seq: i64,
        kind: OperationKind,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE operations SET kind = ? WHERE seq = ?")
            .bind(kind.as_str())
            .bind(seq)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Records that `kind` at `revision` is about to go on the wire.
    pub async fn record_attempt(
        &self,
        seq: i64,
        kind: OperationKind,
        revision: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE operations SET attempt_kind = ?, attempt_revision = ? WHERE seq = ?")
            .bind(kind.as_str())
            .bind(revision)
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Forgets the unconfirmed attempt once the server has answered it.
    pub async fn clear_attempt_in(
        &self,
        conn: &mut SqliteConnection,
        seq: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE operations SET attempt_kind = NULL, attempt_revision = NULL WHERE seq = ?",
        )
        .bind(seq)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get(&self, seq: i64) -> Result<Option<Operation>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.get_in(&mut conn, seq).await
    }

    pub async fn get_in(
        &self,
        conn: &mut SqliteConnection,
        seq: i64,
    ) -> Result<Option<Operation>, sqlx::Error> {
        let record: Option<OperationRecord> =
            sqlx::query_as(&format!("{} WHERE seq = ?", SELECT_OPERATION))
                .bind(seq)
                .fetch_optional(&mut *conn)
                .await?;
        record.map(OperationRecord::into_operation).transpose()
    }

    /// The pending entry for a row, if any.
    pub async fn pending_for(
        &self,
        table: &str,
        row_id: &str,
    ) -> Result<Option<Operation>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.pending_for_in(&mut conn, table, row_id).await
    }

    pub async fn pending_for_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        row_id: &str,
    ) -> Result<Option<Operation>, sqlx::Error> {
        let record: Option<OperationRecord> = sqlx::query_as(&format!(
            "{} WHERE table_name = ? AND row_id = ? ORDER BY seq LIMIT 1",
            SELECT_OPERATION
        ))
        .bind(table)
        .bind(row_id)
        .fetch_optional(&mut *conn)
        .await?;
        record.map(OperationRecord::into_operation).transpose()
    }

    /// Ids of rows in `table` waiting for a delete to be confirmed.
    pub async fn pending_deletes(&self, table: &str) -> Result<HashSet<String>, sqlx::Error> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT row_id FROM operations WHERE table_name = ? AND kind = 'delete'",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// All pending entries in sequence order, optionally for one table.
    pub async fn list(&self, scope: Option<&str>) -> Result<Vec<Operation>, sqlx::Error> {
        let records: Vec<OperationRecord> = sqlx::query_as(&format!(
            "{} WHERE (?1 IS NULL OR table_name = ?1) ORDER BY seq",
            SELECT_OPERATION
        ))
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        records
            .into_iter()
            .map(OperationRecord::into_operation)
            .collect()
    }

    pub async fn count(&self, scope: Option<&str>) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM operations WHERE (?1 IS NULL OR table_name = ?1)")
            .bind(scope)
            .fetch_one(&self.pool)
            .await
    }

    /// Highest sequence number currently queued.
    pub async fn max_seq(&self, scope: Option<&str>) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT MAX(seq) FROM operations WHERE (?1 IS NULL OR table_name = ?1)")
            .bind(scope)
            .fetch_one(&self.pool)
            .await
    }

    async fn next_after(
        &self,
        scope: Option<&str>,
        after: i64,
        ceiling: i64,
    ) -> Result<Option<Operation>, sqlx::Error> {
        let record: Option<OperationRecord> = sqlx::query_as(&format!(
            "{} WHERE seq > ?1 AND seq <= ?2 AND (?3 IS NULL OR table_name = ?3) ORDER BY seq LIMIT 1",
            SELECT_OPERATION
        ))
        .bind(after)
        .bind(ceiling)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        record.map(OperationRecord::into_operation).transpose()
    }

    /// Lazily yields pending entries with `seq <= ceiling` in sequence order.
    ///
    /// Each entry is read when it is polled, so a payload coalesced before
    /// that point is observed. Nothing is removed; a new drain starts again
    /// from the oldest entry still queued.
    pub fn drain<'a>(
        &'a self,
        scope: Option<&'a str>,
        ceiling: i64,
    ) -> impl Stream<Item = Result<Operation, sqlx::Error>> + 'a {
        stream::try_unfold(0i64, move |after| async move {
            let next = self.next_after(scope, after, ceiling).await?;
            Ok::<_, sqlx::Error>(next.map(|op| {
                let seq = op.seq;
                (op, seq)
            }))
        })
    }

    /// Removes an entry. Returns false if it was already gone.
    pub async fn discard(&self, seq: i64) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.discard_in(&mut conn, seq).await
    }

    pub async fn discard_in(
        &self,
        conn: &mut SqliteConnection,
        seq: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM operations WHERE seq = ?")
            .bind(seq)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn discard_table_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM operations WHERE table_name = ?")
            .bind(table)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::init_db;
    use futures::TryStreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    struct TestContext {
        pool: SqlitePool,
        log: OperationLog,
        _temp_dir: TempDir,
    }

    async fn setup_log() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(temp_dir.path().join("test.db")).await.unwrap();
        TestContext {
            log: OperationLog::new(pool.clone()),
            pool,
            _temp_dir: temp_dir,
        }
    }

    fn payload(name: &str) -> Payload {
        json!({ "name": name }).as_object().cloned().unwrap()
    }

    async fn enqueue(
        ctx: &TestContext,
        row_id: &str,
        kind: OperationKind,
        name: &str,
    ) -> Enqueued {
        let mut conn = ctx.pool.acquire().await.unwrap();
        ctx.log
            .enqueue_in(&mut conn, "items", row_id, kind, &payload(name), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic() {
        let ctx = setup_log().await;

        let a = enqueue(&ctx, "a", OperationKind::Insert, "1").await;
        let b = enqueue(&ctx, "b", OperationKind::Insert, "2").await;
        assert!(matches!(a, Enqueued::Appended(_)));
        assert!(b.seq() > a.seq());

        // A discarded seq is never handed out again
        ctx.log.discard(b.seq()).await.unwrap();
        let c = enqueue(&ctx, "c", OperationKind::Insert, "3").await;
        assert!(c.seq() > b.seq());
    }

    #[tokio::test]
    async fn test_consecutive_updates_coalesce() {
        let ctx = setup_log().await;

        let first = enqueue(&ctx, "a", OperationKind::Update, "24").await;
        let second = enqueue(&ctx, "a", OperationKind::Update, "42").await;

        assert_eq!(second, Enqueued::Coalesced(first.seq()));
        let ops = ctx.log.list(None).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].seq, first.seq());
        assert_eq!(ops[0].kind, OperationKind::Update);
        assert_eq!(ops[0].fields, payload("42"));
        assert_eq!(ops[0].revision, 1);
    }

    #[tokio::test]
    async fn test_update_after_insert_stays_insert() {
        let ctx = setup_log().await;

        enqueue(&ctx, "a", OperationKind::Insert, "24").await;
        enqueue(&ctx, "a", OperationKind::Update, "42").await;

        let op = ctx.log.pending_for("items", "a").await.unwrap().unwrap();
        assert_eq!(op.kind, OperationKind::Insert);
        assert_eq!(op.fields, payload("42"));
    }

    #[tokio::test]
    async fn test_delete_cancels_unsent_insert() {
        let ctx = setup_log().await;

        let insert = enqueue(&ctx, "a", OperationKind::Insert, "24").await;
        let delete = enqueue(&ctx, "a", OperationKind::Delete, "24").await;

        assert_eq!(delete, Enqueued::Cancelled(insert.seq()));
        assert_eq!(ctx.log.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_of_in_flight_insert_becomes_delete() {
        let ctx = setup_log().await;

        let insert = enqueue(&ctx, "a", OperationKind::Insert, "24").await;
        let mut conn = ctx.pool.acquire().await.unwrap();
        let delete = ctx
            .log
            .enqueue_in(
                &mut conn,
                "items",
                "a",
                OperationKind::Delete,
                &payload("24"),
                Some(insert.seq()),
            )
            .await
            .unwrap();

        assert_eq!(delete, Enqueued::Coalesced(insert.seq()));
        let op = ctx.log.get(insert.seq()).await.unwrap().unwrap();
        assert_eq!(op.kind, OperationKind::Delete);
        assert_eq!(op.revision, 1);
    }

    #[tokio::test]
    async fn test_delete_of_possibly_delivered_insert_becomes_delete() {
        let ctx = setup_log().await;

        let insert = enqueue(&ctx, "a", OperationKind::Insert, "24").await;
        ctx.log
            .record_attempt(insert.seq(), OperationKind::Insert, 0)
            .await
            .unwrap();
        let delete = enqueue(&ctx, "a", OperationKind::Delete, "24").await;

        assert_eq!(delete, Enqueued::Coalesced(insert.seq()));
        let op = ctx.log.get(insert.seq()).await.unwrap().unwrap();
        assert_eq!(op.kind, OperationKind::Delete);
        assert_eq!(
            op.attempt,
            Some(Attempt {
                kind: OperationKind::Insert,
                revision: 0
            })
        );

        let mut conn = ctx.pool.acquire().await.unwrap();
        ctx.log.clear_attempt_in(&mut conn, op.seq).await.unwrap();
        assert_eq!(ctx.log.get(op.seq).await.unwrap().unwrap().attempt, None);
    }

    #[tokio::test]
    async fn test_delete_after_update_becomes_delete() {
        let ctx = setup_log().await;

        let update = enqueue(&ctx, "a", OperationKind::Update, "24").await;
        enqueue(&ctx, "a", OperationKind::Delete, "24").await;
        enqueue(&ctx, "a", OperationKind::Delete, "24").await;

        let ops = ctx.log.list(Some("items")).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].seq, update.seq());
        assert_eq!(ops[0].kind, OperationKind::Delete);
        assert_eq!(
            ctx.log.pending_deletes("items").await.unwrap(),
            HashSet::from(["a".to_string()])
        );
    }

    #[tokio::test]
    async fn test_drain_is_ordered_bounded_and_restartable() {
        let ctx = setup_log().await;

        let a = enqueue(&ctx, "a", OperationKind::Insert, "1").await;
        let b = enqueue(&ctx, "b", OperationKind::Insert, "2").await;
        let ceiling = ctx.log.max_seq(None).await.unwrap().unwrap();
        // Enqueued after the ceiling was taken, belongs to the next cycle
        enqueue(&ctx, "c", OperationKind::Insert, "3").await;

        let drained: Vec<Operation> = ctx.log.drain(None, ceiling).try_collect().await.unwrap();
        let seqs: Vec<i64> = drained.iter().map(|op| op.seq).collect();
        assert_eq!(seqs, vec![a.seq(), b.seq()]);

        // Draining consumed nothing
        assert_eq!(ctx.log.count(None).await.unwrap(), 3);
        let again: Vec<Operation> = ctx.log.drain(None, ceiling).try_collect().await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_drain_scoped_to_table() {
        let ctx = setup_log().await;

        enqueue(&ctx, "a", OperationKind::Insert, "1").await;
        let mut conn = ctx.pool.acquire().await.unwrap();
        ctx.log
            .enqueue_in(&mut conn, "other", "z", OperationKind::Insert, &payload("9"), None)
            .await
            .unwrap();

        let drained: Vec<Operation> = ctx
            .log
            .drain(Some("other"), i64::MAX)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].row_id, "z");
        assert_eq!(ctx.log.count(Some("items")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_discard_missing_returns_false() {
        let ctx = setup_log().await;
        assert!(!ctx.log.discard(99).await.unwrap());
        assert_eq!(ctx.log.max_seq(None).await.unwrap(), None);
    }
}
