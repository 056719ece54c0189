//! Push and pull against the remote table service.
//!
//! A push walks the operation log in sequence order. Network calls happen
//! outside the write gate; the gate is only held to read the row before a
//! call and to settle the outcome after it, so facade writes keep flowing
//! while a push is running.

use futures::TryStreamExt;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};

use super::error::SyncError;
use super::report::{
    Conflict, OperationOutcome, PullReport, PushPhase, PushReport, Resolution, SyncResult,
};
use crate::models::{
    strip_system_properties, Operation, OperationKind, RemoteRow, Row, Version,
};
use crate::remote::{RemoteError, RemoteTable};
use crate::store::{LocalStore, OperationLog, SyncState};

/// Tunables for network interaction.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Upper bound for each remote call; expiry counts as a transport failure.
    pub request_timeout: Duration,
    /// Rows requested per pull round-trip.
    pub page_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            page_size: 50,
        }
    }
}

/// The write gate: serializes every atomic unit on one context and records
/// which operation is on the wire.
///
/// The in-flight marker sits behind a plain mutex so a push whose future is
/// dropped can clear it synchronously.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    lock: Mutex<()>,
    in_flight: std::sync::Mutex<Option<i64>>,
}

impl Gate {
    pub(crate) async fn lock(&self) -> GateGuard<'_> {
        GateGuard {
            gate: self,
            _held: self.lock.lock().await,
        }
    }

    fn set_in_flight(&self, seq: Option<i64>) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = seq;
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a Gate,
    _held: MutexGuard<'a, ()>,
}

impl GateGuard<'_> {
    /// Operation currently on the wire, if any.
    pub(crate) fn in_flight(&self) -> Option<i64> {
        *self
            .gate
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_in_flight(&self, seq: Option<i64>) {
        self.gate.set_in_flight(seq);
    }
}

/// Puts the engine back to idle however a push ends, including when the
/// caller drops its future mid-call.
struct PushGuard<'a> {
    gate: &'a Gate,
    phase: &'a watch::Sender<PushPhase>,
}

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        self.gate.set_in_flight(None);
        self.phase.send_replace(PushPhase::Idle);
    }
}

/// An operation ready to go on the wire.
struct Outgoing {
    /// What is sent: the queued operation, or an earlier unconfirmed
    /// delivery of it being replayed.
    op: Operation,
    /// `None` when the local row is gone.
    row: Option<Row>,
    replay: bool,
}

enum Reply {
    Stored(RemoteRow),
    Deleted,
}

pub(crate) struct SyncEngine {
    pool: SqlitePool,
    store: LocalStore,
    log: OperationLog,
    state: SyncState,
    remote: Arc<dyn RemoteTable>,
    gate: Arc<Gate>,
    push_lock: Mutex<()>,
    phase: watch::Sender<PushPhase>,
    options: SyncOptions,
    client_id: String,
}

impl SyncEngine {
    pub(crate) fn new(
        pool: SqlitePool,
        remote: Arc<dyn RemoteTable>,
        gate: Arc<Gate>,
        options: SyncOptions,
        client_id: String,
    ) -> Self {
        let (phase, _) = watch::channel(PushPhase::Idle);
        Self {
            store: LocalStore::new(pool.clone()),
            log: OperationLog::new(pool.clone()),
            state: SyncState::new(pool.clone()),
            pool,
            remote,
            gate,
            push_lock: Mutex::new(()),
            phase,
            options,
            client_id,
        }
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn phase(&self) -> PushPhase {
        *self.phase.borrow()
    }

    pub(crate) fn watch_phase(&self) -> watch::Receiver<PushPhase> {
        self.phase.subscribe()
    }

    /// Runs one push cycle over `scope` (a table name, or every table).
    pub(crate) async fn push(
        &self,
        scope: Option<&str>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PushReport, SyncError> {
        let _running = self
            .push_lock
            .try_lock()
            .map_err(|_| SyncError::PushInProgress)?;

        self.phase.send_replace(PushPhase::Pushing);
        let idle = PushGuard {
            gate: &self.gate,
            phase: &self.phase,
        };
        let result = self.push_cycle(scope, &mut cancel).await;
        drop(idle);

        match &result {
            Ok(report) => tracing::info!(
                "Push finished ({:?}): {} applied, {} not applied, {} still queued",
                report.status,
                report.applied(),
                report.errors().count(),
                report.remaining
            ),
            Err(e) => tracing::error!("Push aborted: {}", e),
        }
        result
    }

    async fn push_cycle(
        &self,
        scope: Option<&str>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<PushReport, SyncError> {
        // Anything enqueued after this point waits for the next cycle
        let Some(ceiling) = self
            .log
            .max_seq(scope)
            .await
            .map_err(SyncError::StoreReadFailed)?
        else {
            tracing::debug!("Operation log empty, nothing to push");
            return Ok(PushReport::new(Vec::new(), 0, false));
        };

        let mut outcomes = Vec::new();
        let mut cancelled = false;

        let ops = self.log.drain(scope, ceiling);
        futures::pin_mut!(ops);

        'drain: while let Some(drained) =
            ops.try_next().await.map_err(SyncError::StoreReadFailed)?
        {
            if *cancel.borrow() {
                cancelled = true;
                break;
            }

            let mut seq = Some(drained.seq);
            while let Some(next) = seq.take() {
                let Some(outgoing) = self.begin_send(next).await? else {
                    // Discarded or cancelled since it was drained
                    break;
                };
                let Outgoing { op, row, replay } = outgoing;
                let Some(row) = row else {
                    let report = self.report(outcomes, scope, cancelled).await?;
                    return Err(SyncError::Consistency {
                        seq: op.seq,
                        table: op.table,
                        row_id: op.row_id,
                        report: Box::new(report),
                    });
                };

                if replay {
                    tracing::debug!("Replaying unconfirmed delivery {}", op);
                } else {
                    tracing::debug!("Sending {}", op);
                }
                let Some(reply) = self.send(&op, &row, cancel).await else {
                    self.gate.lock().await.set_in_flight(None);
                    tracing::info!("Push cancelled, operation #{} stays queued", op.seq);
                    cancelled = true;
                    break;
                };

                let result = self.settle(&op, row, reply).await?;
                if replay && matches!(result, SyncResult::Applied { .. }) {
                    // The earlier delivery is settled; now send what is queued
                    seq = Some(op.seq);
                    continue;
                }

                let halt = matches!(result, SyncResult::Failed { retryable: true, .. });
                outcomes.push(OperationOutcome {
                    seq: op.seq,
                    table: op.table,
                    row_id: op.row_id,
                    kind: op.kind,
                    result,
                });
                if halt {
                    tracing::warn!(
                        "Transport failure, stopping push; remaining operations stay queued"
                    );
                    break 'drain;
                }
            }
            if cancelled {
                break;
            }
        }

        self.report(outcomes, scope, cancelled).await
    }

    async fn report(
        &self,
        outcomes: Vec<OperationOutcome>,
        scope: Option<&str>,
        cancelled: bool,
    ) -> Result<PushReport, SyncError> {
        let remaining = self
            .log
            .count(scope)
            .await
            .map_err(SyncError::StoreReadFailed)?;
        Ok(PushReport::new(outcomes, remaining, cancelled))
    }

    /// Re-reads the operation and its row under the gate, marks it in flight
    /// and records the delivery attempt before anything goes on the wire.
    ///
    /// `None` when the operation is gone.
    async fn begin_send(&self, seq: i64) -> Result<Option<Outgoing>, SyncError> {
        let gate = self.gate.lock().await;

        let Some(queued) = self.log.get(seq).await.map_err(SyncError::StoreReadFailed)? else {
            return Ok(None);
        };
        let row = self
            .store
            .get(&queued.table, &queued.row_id)
            .await
            .map_err(SyncError::StoreReadFailed)?;

        let (op, replay) = match queued.replay() {
            Some(earlier) => (earlier, true),
            None => (queued, false),
        };
        if row.is_some() {
            self.log
                .record_attempt(op.seq, op.kind, op.revision)
                .await
                .map_err(SyncError::StoreWriteFailed)?;
            gate.set_in_flight(Some(seq));
        }
        Ok(Some(Outgoing { op, row, replay }))
    }

    /// Sends one operation. `None` means the push was cancelled mid-call.
    async fn send(
        &self,
        op: &Operation,
        row: &Row,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<Result<Reply, RemoteError>> {
        let key = op.idempotency_key(&self.client_id);
        let call = async {
            match op.kind {
                OperationKind::Insert => {
                    let outgoing = Row::new(op.row_id.clone(), op.fields.clone());
                    self.remote
                        .insert(&op.table, &outgoing, &key)
                        .await
                        .map(Reply::Stored)
                }
                OperationKind::Update => {
                    let outgoing = Row {
                        id: op.row_id.clone(),
                        version: row.version.clone(),
                        fields: op.fields.clone(),
                    };
                    self.remote
                        .update(&op.table, &outgoing, &key)
                        .await
                        .map(Reply::Stored)
                }
                OperationKind::Delete => {
                    match self
                        .remote
                        .delete(&op.table, &op.row_id, row.version.as_ref(), &key)
                        .await
                    {
                        // Already gone on the server is as good as deleted
                        Ok(()) | Err(RemoteError::NotFound) => Ok(Reply::Deleted),
                        Err(e) => Err(e),
                    }
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancelled(cancel) => None,
            result = tokio::time::timeout(self.options.request_timeout, call) => {
                Some(result.unwrap_or(Err(RemoteError::Timeout)))
            }
        }
    }

    /// Applies the reply to the local store under the gate.
    async fn settle(
        &self,
        sent: &Operation,
        local: Row,
        reply: Result<Reply, RemoteError>,
    ) -> Result<SyncResult, SyncError> {
        let gate = self.gate.lock().await;
        gate.set_in_flight(None);

        let mut tx = self.pool.begin().await.map_err(SyncError::StoreWriteFailed)?;
        // Any answer other than a transport failure settles the attempt
        let answered = reply.as_ref().map_or_else(|e| !e.is_retryable(), |_| true);
        if answered {
            self.log
                .clear_attempt_in(&mut tx, sent.seq)
                .await
                .map_err(SyncError::StoreWriteFailed)?;
        }

        match reply {
            Ok(reply) => {
                let version = self
                    .apply_in(&mut tx, sent, reply)
                    .await
                    .map_err(SyncError::StoreWriteFailed)?;
                tx.commit().await.map_err(SyncError::StoreWriteFailed)?;
                tracing::debug!("Applied #{} ({} {})", sent.seq, sent.kind, sent.row_id);
                Ok(SyncResult::Applied { version })
            }
            Err(RemoteError::Conflict(server)) => {
                tx.commit().await.map_err(SyncError::StoreWriteFailed)?;
                tracing::warn!(
                    "Conflict on {}/{}: local version {:?}, server version {:?}",
                    sent.table,
                    sent.row_id,
                    local.version,
                    server.row.version
                );
                Ok(SyncResult::Conflicted(Box::new(Conflict {
                    seq: sent.seq,
                    table: sent.table.clone(),
                    kind: sent.kind,
                    local,
                    server: *server,
                })))
            }
            Err(RemoteError::NotFound) => {
                tx.commit().await.map_err(SyncError::StoreWriteFailed)?;
                Ok(SyncResult::Failed {
                    reason: format!("row '{}' no longer exists on the server", sent.row_id),
                    retryable: false,
                })
            }
            Err(e) => {
                tx.commit().await.map_err(SyncError::StoreWriteFailed)?;
                tracing::debug!("Operation #{} failed: {}", sent.seq, e);
                Ok(SyncResult::Failed {
                    reason: e.to_string(),
                    retryable: e.is_retryable(),
                })
            }
        }
    }

    async fn apply_in(
        &self,
        conn: &mut SqliteConnection,
        sent: &Operation,
        reply: Reply,
    ) -> Result<Option<Version>, sqlx::Error> {
        let current = self.log.get_in(conn, sent.seq).await?;

        let server = match reply {
            Reply::Deleted => {
                match current {
                    Some(current) if current.revision != sent.revision => {
                        // Inserted again locally while the delete was on the wire
                        self.store
                            .set_version_in(conn, &sent.table, &sent.row_id, None)
                            .await?;
                        self.log
                            .set_kind_in(conn, sent.seq, OperationKind::Insert)
                            .await?;
                    }
                    _ => {
                        self.store.delete_in(conn, &sent.table, &sent.row_id).await?;
                        self.log.discard_in(conn, sent.seq).await?;
                    }
                }
                return Ok(None);
            }
            Reply::Stored(server) => server,
        };
        let version = server.row.version.clone();

        match current {
            Some(current) if current.revision == sent.revision => {
                self.store.upsert_in(conn, &sent.table, &server.row).await?;
                self.log.discard_in(conn, sent.seq).await?;
            }
            Some(current) => {
                // Coalesced while on the wire: keep the newer local payload,
                // remember the version it must now be sent against.
                self.store
                    .set_version_in(conn, &sent.table, &sent.row_id, version.as_ref())
                    .await?;
                if current.kind == OperationKind::Insert {
                    self.log
                        .set_kind_in(conn, sent.seq, OperationKind::Update)
                        .await?;
                }
                tracing::debug!(
                    "Operation #{} changed in flight, requeued at revision {}",
                    sent.seq,
                    current.revision
                );
            }
            None => {
                // Discarded by the caller while on the wire
                self.store
                    .set_version_in(conn, &sent.table, &sent.row_id, version.as_ref())
                    .await?;
            }
        }
        Ok(version)
    }

    /// Fetches rows changed since the table's mark and merges them locally.
    pub(crate) async fn pull(&self, table: &str) -> Result<PullReport, SyncError> {
        let mut report = PullReport::default();
        let mut mark = self
            .state
            .pull_mark(table)
            .await
            .map_err(SyncError::StoreReadFailed)?;

        loop {
            let page = tokio::time::timeout(
                self.options.request_timeout,
                self.remote.changes(table, mark, self.options.page_size),
            )
            .await
            .unwrap_or(Err(RemoteError::Timeout))?;

            let previous = mark;
            {
                let _gate = self.gate.lock().await;
                let mut tx = self.pool.begin().await.map_err(SyncError::StoreWriteFailed)?;
                mark = self
                    .merge_page_in(&mut tx, table, &page, mark, &mut report)
                    .await
                    .map_err(SyncError::StoreWriteFailed)?;
                tx.commit().await.map_err(SyncError::StoreWriteFailed)?;
            }

            if page.len() < self.options.page_size {
                break;
            }
            if mark == previous {
                tracing::warn!("Pull of '{}' made no progress, stopping", table);
                break;
            }
        }

        tracing::info!(
            "Pulled '{}': {} received, {} upserted, {} deleted, {} skipped",
            table,
            report.received,
            report.upserted,
            report.deleted,
            report.skipped
        );
        Ok(report)
    }

    async fn merge_page_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        page: &[RemoteRow],
        mut mark: Option<chrono::DateTime<chrono::Utc>>,
        report: &mut PullReport,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, sqlx::Error> {
        for remote in page {
            report.received += 1;

            if self
                .log
                .pending_for_in(conn, table, &remote.row.id)
                .await?
                .is_some()
            {
                // Unsynced local edits win over pulled data
                report.skipped += 1;
            } else if remote.deleted {
                if self.store.delete_in(conn, table, &remote.row.id).await? {
                    report.deleted += 1;
                }
            } else {
                self.store.upsert_in(conn, table, &remote.row).await?;
                report.upserted += 1;
            }

            if let Some(updated_at) = remote.updated_at {
                mark = Some(mark.map_or(updated_at, |m| m.max(updated_at)));
            }
        }

        if let Some(mark) = mark {
            self.state.set_pull_mark_in(conn, table, mark).await?;
        }
        Ok(mark)
    }

    /// Settles a conflict the way the caller chose.
    pub(crate) async fn resolve(
        &self,
        conflict: &Conflict,
        resolution: Resolution,
    ) -> Result<(), SyncError> {
        let gate = self.gate.lock().await;
        if gate.in_flight() == Some(conflict.seq) {
            return Err(SyncError::PushInProgress);
        }

        let mut tx = self.pool.begin().await.map_err(SyncError::StoreWriteFailed)?;
        let op = self
            .log
            .get_in(&mut tx, conflict.seq)
            .await
            .map_err(SyncError::StoreWriteFailed)?
            .ok_or(SyncError::OperationNotFound(conflict.seq))?;

        match resolution {
            Resolution::AcceptServer => {
                let taken = if conflict.server.deleted {
                    self.store.delete_in(&mut tx, &op.table, &op.row_id).await.map(|_| ())
                } else {
                    self.store
                        .upsert_in(&mut tx, &op.table, &conflict.server.row)
                        .await
                };
                taken.map_err(SyncError::StoreWriteFailed)?;
                self.log
                    .discard_in(&mut tx, op.seq)
                    .await
                    .map_err(SyncError::StoreWriteFailed)?;
            }
            Resolution::Discard => {
                self.log
                    .discard_in(&mut tx, op.seq)
                    .await
                    .map_err(SyncError::StoreWriteFailed)?;
            }
            Resolution::CancelAndDiscard => {
                self.log
                    .discard_in(&mut tx, op.seq)
                    .await
                    .map_err(SyncError::StoreWriteFailed)?;
                self.store
                    .delete_in(&mut tx, &op.table, &op.row_id)
                    .await
                    .map_err(SyncError::StoreWriteFailed)?;
            }
            Resolution::RetryWith(mut fields) => {
                strip_system_properties(&mut fields);
                let merged = Row {
                    id: op.row_id.clone(),
                    version: conflict.server.row.version.clone(),
                    fields,
                };
                self.store
                    .upsert_in(&mut tx, &op.table, &merged)
                    .await
                    .map_err(SyncError::StoreWriteFailed)?;
                self.log
                    .rewrite_in(&mut tx, op.seq, OperationKind::Update, &merged.fields)
                    .await
                    .map_err(SyncError::StoreWriteFailed)?;
            }
        }

        tx.commit().await.map_err(SyncError::StoreWriteFailed)?;
        tracing::info!("Resolved operation #{} on {}/{}", op.seq, op.table, op.row_id);
        Ok(())
    }
}

/// Resolves once cancellation is requested; never if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
