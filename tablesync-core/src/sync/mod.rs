//! Sync engine, table facade and the context tying them together.

mod context;
mod engine;
mod error;
mod report;
mod table;

pub use context::{PushHandle, SyncContext};
pub use engine::SyncOptions;
pub use error::SyncError;
pub use report::{
    Conflict, OperationOutcome, PullReport, PushPhase, PushReport, PushStatus, Resolution,
    SyncResult,
};
pub use table::SyncTable;
