//! Sync error types.

use super::report::PushReport;
use crate::remote::RemoteError;

/// Errors that abort a facade call, a push or a pull.
///
/// Per-operation transport failures and conflicts are not errors: they are
/// reported inside [`PushReport`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The local write and its log entry were rolled back together.
    #[error("Local store write failed: {0}")]
    StoreWriteFailed(#[source] sqlx::Error),

    #[error("Local store read failed: {0}")]
    StoreReadFailed(#[source] sqlx::Error),

    /// A queued operation references a row the local store no longer has.
    #[error("Operation #{seq} references row '{row_id}' missing from table '{table}'")]
    Consistency {
        seq: i64,
        table: String,
        row_id: String,
        /// Outcomes of the operations drained before the push stopped.
        report: Box<PushReport>,
    },

    #[error("Row '{0}' not found")]
    RowNotFound(String),

    #[error("Row '{0}' already exists")]
    RowExists(String),

    #[error("Operation #{0} not found")]
    OperationNotFound(i64),

    #[error("A push is already in progress")]
    PushInProgress,

    #[error("Table '{table}' has {count} pending operation(s); purge with force to drop them")]
    PendingOperations { table: String, count: i64 },

    #[error("Invalid table name: '{0}'")]
    InvalidTableName(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Background push aborted: {0}")]
    Aborted(String),
}
