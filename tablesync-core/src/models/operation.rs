use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::row::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            _ => Err(format!(
                "Invalid operation kind: {}. Valid options: insert, update, delete",
                s
            )),
        }
    }
}

/// A delivery of an operation whose reply never arrived (transport failure,
/// timeout, cancellation or a dropped push). The server may have applied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub kind: OperationKind,
    pub revision: i64,
}

/// A pending local mutation that the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub seq: i64,
    pub table: String,
    pub row_id: String,
    pub kind: OperationKind,
    /// Payload snapshot taken when the operation was enqueued or last coalesced.
    pub fields: Payload,
    /// Bumped every time a later mutation is folded into this entry.
    pub revision: i64,
    pub enqueued_at: DateTime<Utc>,
    /// Last delivery with an unknown outcome, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<Attempt>,
}

impl Operation {
    /// Key the server uses to recognise a retried delivery of this exact payload.
    pub fn idempotency_key(&self, client_id: &str) -> String {
        format!("{}:{}:{}", client_id, self.seq, self.revision)
    }

    /// The earlier delivery to re-send under its own key before this
    /// revision goes out, so a server that already applied it replays its
    /// reply instead of seeing a new request.
    ///
    /// A delete folded into an insert needs no replay: sent without a
    /// version it removes the row if the insert landed and is a no-op if not.
    pub fn replay(&self) -> Option<Operation> {
        let attempt = self.attempt?;
        if attempt.revision == self.revision {
            return None;
        }
        if attempt.kind == OperationKind::Insert && self.kind == OperationKind::Delete {
            return None;
        }
        Some(Operation {
            kind: attempt.kind,
            revision: attempt.revision,
            ..self.clone()
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {}/{} (rev {}, queued {})",
            self.seq,
            self.kind,
            self.table,
            self.row_id,
            self.revision,
            self.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}
