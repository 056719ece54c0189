//! Tablesync Core Library
//!
//! Offline-first tables: local SQLite rows, a durable operation log, and a
//! sync engine that pushes and pulls against a remote table service.

pub mod models;
pub mod remote;
pub mod store;
pub mod sync;

pub use models::{Attempt, Operation, OperationKind, Payload, RemoteRow, Row, Version};
pub use remote::{HttpHook, HttpRemote, LoggingHook, MemoryRemote, RemoteError, RemoteTable};
pub use store::init_db;
pub use sync::{
    Conflict, OperationOutcome, PullReport, PushHandle, PushPhase, PushReport, PushStatus,
    Resolution, SyncContext, SyncError, SyncOptions, SyncResult, SyncTable,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
