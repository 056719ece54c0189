use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::engine::{Gate, SyncEngine, SyncOptions};
use super::error::SyncError;
use super::report::{Conflict, PushPhase, PushReport, Resolution};
use super::table::SyncTable;
use crate::models::Operation;
use crate::remote::RemoteTable;
use crate::store::{init_db, LocalStore, OperationLog, SyncState};

pub(crate) struct Shared {
    pub(crate) pool: SqlitePool,
    pub(crate) store: LocalStore,
    pub(crate) log: OperationLog,
    pub(crate) state: SyncState,
    pub(crate) gate: Arc<Gate>,
    pub(crate) engine: SyncEngine,
}

/// Handle to one local database synchronized with one remote service.
///
/// Cheap to clone; all clones share the write gate and the engine.
#[derive(Clone)]
pub struct SyncContext {
    shared: Arc<Shared>,
}

impl SyncContext {
    pub async fn open(
        pool: SqlitePool,
        remote: Arc<dyn RemoteTable>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let state = SyncState::new(pool.clone());
        let client_id = state
            .client_id()
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        let gate = Arc::new(Gate::default());

        tracing::debug!("Sync context opened for client {}", client_id);
        Ok(Self {
            shared: Arc::new(Shared {
                store: LocalStore::new(pool.clone()),
                log: OperationLog::new(pool.clone()),
                engine: SyncEngine::new(pool.clone(), remote, gate.clone(), options, client_id),
                state,
                gate,
                pool,
            }),
        })
    }

    /// Opens (creating if needed) the database at `path`.
    pub async fn open_path(
        path: impl AsRef<Path>,
        remote: Arc<dyn RemoteTable>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let pool = init_db(path).await.map_err(SyncError::StoreWriteFailed)?;
        Self::open(pool, remote, options).await
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Facade over one table. Names are limited to ASCII letters, digits,
    /// `_` and `-`.
    pub fn table(&self, name: &str) -> Result<SyncTable, SyncError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SyncError::InvalidTableName(name.to_string()));
        }
        Ok(SyncTable::new(self.clone(), name.to_string()))
    }

    pub fn client_id(&self) -> &str {
        self.shared.engine.client_id()
    }

    /// Pushes every table's pending operations.
    pub async fn push(&self) -> Result<PushReport, SyncError> {
        self.shared.engine.push(None, never_cancelled()).await
    }

    /// Runs a push of every table on a background task.
    pub fn spawn_push(&self) -> PushHandle {
        let (cancel, cancel_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let task = tokio::spawn(async move { shared.engine.push(None, cancel_rx).await });
        PushHandle { cancel, task }
    }

    pub fn phase(&self) -> PushPhase {
        self.shared.engine.phase()
    }

    pub fn watch_phase(&self) -> watch::Receiver<PushPhase> {
        self.shared.engine.watch_phase()
    }

    /// Every queued operation, oldest first.
    pub async fn pending_operations(&self) -> Result<Vec<Operation>, SyncError> {
        self.shared
            .log
            .list(None)
            .await
            .map_err(SyncError::StoreReadFailed)
    }

    pub async fn resolve(
        &self,
        conflict: &Conflict,
        resolution: Resolution,
    ) -> Result<(), SyncError> {
        self.shared.engine.resolve(conflict, resolution).await
    }

    /// Drops a queued operation, leaving the local row as it is.
    pub async fn discard_operation(&self, seq: i64) -> Result<(), SyncError> {
        let gate = self.shared.gate.lock().await;
        if gate.in_flight() == Some(seq) {
            return Err(SyncError::PushInProgress);
        }

        if !self
            .shared
            .log
            .discard(seq)
            .await
            .map_err(SyncError::StoreWriteFailed)?
        {
            return Err(SyncError::OperationNotFound(seq));
        }
        tracing::info!("Discarded operation #{}", seq);
        Ok(())
    }

    /// Drops a queued operation together with the local row it refers to.
    pub async fn cancel_and_discard(&self, seq: i64) -> Result<(), SyncError> {
        let gate = self.shared.gate.lock().await;
        if gate.in_flight() == Some(seq) {
            return Err(SyncError::PushInProgress);
        }

        let mut tx = self
            .shared
            .pool
            .begin()
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        let op = self
            .shared
            .log
            .get_in(&mut tx, seq)
            .await
            .map_err(SyncError::StoreWriteFailed)?
            .ok_or(SyncError::OperationNotFound(seq))?;
        self.shared
            .log
            .discard_in(&mut tx, seq)
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        self.shared
            .store
            .delete_in(&mut tx, &op.table, &op.row_id)
            .await
            .map_err(SyncError::StoreWriteFailed)?;
        tx.commit().await.map_err(SyncError::StoreWriteFailed)?;

        tracing::info!(
            "Cancelled operation #{} and dropped {}/{}",
            seq,
            op.table,
            op.row_id
        );
        Ok(())
    }
}

/// A push running on a background task.
pub struct PushHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<PushReport, SyncError>>,
}

impl PushHandle {
    /// Asks the push to stop. The operation on the wire stays queued.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<PushReport, SyncError> {
        self.task
            .await
            .map_err(|e| SyncError::Aborted(e.to_string()))?
    }
}

pub(crate) fn never_cancelled() -> watch::Receiver<bool> {
    watch::channel(false).1
}
