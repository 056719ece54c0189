use serde_json::Value;
use uuid::Uuid;

use super::context::{never_cancelled, SyncContext};
use super::error::SyncError;
use super::report::{PullReport, PushReport};
use crate::models::{strip_system_properties, Operation, OperationKind, Payload, Row};
use crate::store::Enqueued;

/// CRUD over one synchronized table.
///
/// Every mutation writes the local row and its operation log entry in one
/// transaction; nothing here talks to the network except `push` and `pull`.
/// Rows with a pending delete stay stored until the server confirms, but are
/// hidden from reads.
#[derive(Clone)]
pub struct SyncTable {
    ctx: SyncContext,
    name: String,
}

impl SyncTable {
    pub(crate) fn new(ctx: SyncContext, name: String) -> Self {
        Self { ctx, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a row. The id comes from the payload's `id` field, or a new
    /// UUID when it has none.
    ///
    /// Inserting over a row whose delete is still pending brings it back: the
    /// queued delete turns into an update against the version the server has.
    pub async fn insert(&self, mut fields: Payload) -> Result<Row, SyncError> {
        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        strip_system_properties(&mut fields);
        let mut row = Row::new(id, fields);

        let shared = self.ctx.shared();
        let gate = shared.gate.lock().await;
        let mut tx = shared.pool.begin().await.map_err(SyncError::StoreWriteFailed)?;

        if let Some(existing) = shared
            .store
            .get_in(&mut tx, &self.name, &row.id)
            .await
            .map_err(SyncError::StoreWriteFailed)?
        {
            let pending = shared
                .log
                .pending_for_in(&mut tx, &self.name, &row.id)
                .await
                .map_err(SyncError::StoreWriteFailed)?;
            if !is_delete(pending.as_ref()) {
                return Err(SyncError::RowExists(row.id));
            }
            row.version = existing.version;
        }

        shared
            .store
            .upsert_in(&mut tx, &self.name, &row)
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        let enqueued = shared
            .log
            .enqueue_in(
                &mut tx,
                &self.name,
                &row.id,
                OperationKind::Insert,
                &row.fields,
                gate.in_flight(),
            )
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        tx.commit().await.map_err(SyncError::StoreWriteFailed)?;

        tracing::debug!("Inserted {}/{} ({:?})", self.name, row.id, enqueued);
        Ok(row)
    }

    /// Replaces the payload of an existing row. The stored version is kept
    /// whatever `row.version` says.
    pub async fn update(&self, row: &Row) -> Result<Row, SyncError> {
        let mut fields = row.fields.clone();
        strip_system_properties(&mut fields);

        let shared = self.ctx.shared();
        let gate = shared.gate.lock().await;
        let mut tx = shared.pool.begin().await.map_err(SyncError::StoreWriteFailed)?;

        let existing = shared
            .store
            .get_in(&mut tx, &self.name, &row.id)
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        let pending = shared
            .log
            .pending_for_in(&mut tx, &self.name, &row.id)
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        let existing = match existing {
            Some(existing) if !is_delete(pending.as_ref()) => existing,
            _ => return Err(SyncError::RowNotFound(row.id.clone())),
        };

        let updated = Row {
            id: existing.id,
            version: existing.version,
            fields,
        };
        shared
            .store
            .upsert_in(&mut tx, &self.name, &updated)
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        let enqueued = shared
            .log
            .enqueue_in(
                &mut tx,
                &self.name,
                &updated.id,
                OperationKind::Update,
                &updated.fields,
                gate.in_flight(),
            )
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        tx.commit().await.map_err(SyncError::StoreWriteFailed)?;

        tracing::debug!("Updated {}/{} ({:?})", self.name, updated.id, enqueued);
        Ok(updated)
    }

    /// Deletes a row. Deleting a row that does not exist is a no-op.
    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let shared = self.ctx.shared();
        let gate = shared.gate.lock().await;
        let mut tx = shared.pool.begin().await.map_err(SyncError::StoreWriteFailed)?;

        let Some(existing) = shared
            .store
            .get_in(&mut tx, &self.name, id)
            .await
            .map_err(SyncError::StoreWriteFailed)?
        else {
            tracing::debug!("Delete of missing row {}/{} ignored", self.name, id);
            return Ok(());
        };

        let enqueued = shared
            .log
            .enqueue_in(
                &mut tx,
                &self.name,
                id,
                OperationKind::Delete,
                &existing.fields,
                gate.in_flight(),
            )
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        if let Enqueued::Cancelled(_) = enqueued {
            // The server never heard of it
            shared
                .store
                .delete_in(&mut tx, &self.name, id)
                .await
                .map_err(SyncError::StoreWriteFailed)?;
        }
        tx.commit().await.map_err(SyncError::StoreWriteFailed)?;

        tracing::debug!("Deleted {}/{} ({:?})", self.name, id, enqueued);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Row>, SyncError> {
        let shared = self.ctx.shared();
        let Some(row) = shared
            .store
            .get(&self.name, id)
            .await
            .map_err(SyncError::StoreReadFailed)?
        else {
            return Ok(None);
        };
        let pending = shared
            .log
            .pending_for(&self.name, id)
            .await
            .map_err(SyncError::StoreReadFailed)?;
        Ok((!is_delete(pending.as_ref())).then_some(row))
    }

    /// Every visible row, ordered by id.
    pub async fn list(&self) -> Result<Vec<Row>, SyncError> {
        self.list_where(|_| true).await
    }

    pub async fn list_where<F>(&self, predicate: F) -> Result<Vec<Row>, SyncError>
    where
        F: Fn(&Row) -> bool,
    {
        let shared = self.ctx.shared();
        let deleting = shared
            .log
            .pending_deletes(&self.name)
            .await
            .map_err(SyncError::StoreReadFailed)?;
        shared
            .store
            .list(&self.name, |row| !deleting.contains(&row.id) && predicate(row))
            .await
            .map_err(SyncError::StoreReadFailed)
    }

    /// Pushes this table's pending operations.
    pub async fn push(&self) -> Result<PushReport, SyncError> {
        self.ctx
            .shared()
            .engine
            .push(Some(&self.name), never_cancelled())
            .await
    }

    pub async fn pull(&self) -> Result<PullReport, SyncError> {
        self.ctx.shared().engine.pull(&self.name).await
    }

    /// Removes the local row without recording an operation. Any operation
    /// already queued for it is left alone, so the next push reports a
    /// consistency error for it.
    pub async fn force_purge(&self, id: &str) -> Result<bool, SyncError> {
        let shared = self.ctx.shared();
        let _gate = shared.gate.lock().await;
        let removed = shared
            .store
            .delete(&self.name, id)
            .await
            .map_err(SyncError::StoreWriteFailed)?;

        tracing::warn!(
            "Force purged {}/{} from the local store, bypassing sync",
            self.name,
            id
        );
        Ok(removed)
    }

    /// Drops every local row of the table and its pull mark. Refuses while
    /// operations are pending unless `force`, which discards them too.
    pub async fn purge(&self, force: bool) -> Result<u64, SyncError> {
        let shared = self.ctx.shared();
        let _gate = shared.gate.lock().await;

        let pending = shared
            .log
            .count(Some(&self.name))
            .await
            .map_err(SyncError::StoreReadFailed)?;
        if pending > 0 && !force {
            return Err(SyncError::PendingOperations {
                table: self.name.clone(),
                count: pending,
            });
        }

        let mut tx = shared.pool.begin().await.map_err(SyncError::StoreWriteFailed)?;
        let discarded = shared
            .log
            .discard_table_in(&mut tx, &self.name)
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        let removed = shared
            .store
            .purge_table_in(&mut tx, &self.name)
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        shared
            .state
            .clear_pull_mark_in(&mut tx, &self.name)
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        tx.commit().await.map_err(SyncError::StoreWriteFailed)?;

        if discarded > 0 {
            tracing::warn!(
                "Purged '{}': {} row(s), {} pending operation(s) discarded",
                self.name,
                removed,
                discarded
            );
        } else {
            tracing::info!("Purged '{}': {} row(s)", self.name, removed);
        }
        Ok(removed)
    }

    /// This table's queued operations, oldest first.
    pub async fn pending(&self) -> Result<Vec<Operation>, SyncError> {
        self.ctx
            .shared()
            .log
            .list(Some(&self.name))
            .await
            .map_err(SyncError::StoreReadFailed)
    }
}

fn is_delete(pending: Option<&Operation>) -> bool {
    pending.is_some_and(|op| op.kind == OperationKind::Delete)
}
