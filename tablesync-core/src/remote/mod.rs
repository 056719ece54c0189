//! The remote table service the sync engine talks to.
//!
//! [`RemoteTable`] is the seam: [`HttpRemote`] speaks the HTTP contract
//! below, [`MemoryRemote`] keeps the same semantics in process.
//!
//! ```text
//! POST   /tables/{name}                      insert, 201 | 409 + server row
//! PATCH  /tables/{name}/{id}  If-Match       update, 200 | 412 + server row | 404
//! DELETE /tables/{name}/{id}  If-Match       delete, 204 | 412 + server row | 404
//! GET    /tables/{name}?updatedSince=&limit= changed rows, oldest first
//! ```

mod hook;
mod http;
mod memory;

pub use hook::{HttpHook, LoggingHook, RequestRecord, ResponseRecord};
pub use http::HttpRemote;
pub use memory::{MemoryRemote, DEFAULT_REPLY_CAPACITY};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{RemoteRow, Row, Version};

/// Header carrying the optimistic concurrency token.
pub const IF_MATCH: &str = "If-Match";
/// Header carrying the per-delivery deduplication key.
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Errors reported by a remote table service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    /// The server's row changed since the version we sent (or the id exists).
    #[error("version conflict on row '{}'", .0.row.id)]
    Conflict(Box<RemoteRow>),
    #[error("row not found on server")]
    NotFound,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether sending the same request again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Timeout => true,
            RemoteError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// CRUD-plus-versioning table service.
///
/// `key` is an idempotency key: delivering the same key twice must not apply
/// the mutation twice.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Creates `row` and returns it as stored, with its first version.
    async fn insert(&self, table: &str, row: &Row, key: &str) -> Result<RemoteRow, RemoteError>;

    /// Replaces the payload of `row.id`, conditional on `row.version` when set.
    async fn update(&self, table: &str, row: &Row, key: &str) -> Result<RemoteRow, RemoteError>;

    /// Deletes `id`, conditional on `version` when set.
    async fn delete(
        &self,
        table: &str,
        id: &str,
        version: Option<&Version>,
        key: &str,
    ) -> Result<(), RemoteError>;

    /// Up to `limit` rows changed strictly after `since`, oldest first,
    /// soft-deleted rows included.
    async fn changes(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RemoteRow>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(RemoteError::Timeout.is_retryable());
        assert!(RemoteError::Transport("reset".into()).is_retryable());
        assert!(RemoteError::Rejected {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!RemoteError::Rejected {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!RemoteError::NotFound.is_retryable());
    }
}
