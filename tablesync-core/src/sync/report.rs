use serde::Serialize;

use crate::models::{OperationKind, Payload, RemoteRow, Row, Version};

/// Where the engine is in a push cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPhase {
    Idle,
    Pushing,
}

/// Local and server state of a row whose operation was rejected on version.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub seq: i64,
    pub table: String,
    pub kind: OperationKind,
    pub local: Row,
    pub server: RemoteRow,
}

/// How the caller settles a [`Conflict`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Take the server row locally and drop the operation.
    AcceptServer,
    /// Drop the operation, keep the local row as is.
    Discard,
    /// Drop the operation and the local row.
    CancelAndDiscard,
    /// Store this payload on top of the server version and send it again.
    RetryWith(Payload),
}

/// Outcome of one drained operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult {
    Applied { version: Option<Version> },
    Conflicted(Box<Conflict>),
    Failed { reason: String, retryable: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub seq: i64,
    pub table: String,
    pub row_id: String,
    pub kind: OperationKind,
    pub result: SyncResult,
}

impl OperationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self.result, SyncResult::Applied { .. })
    }

    pub fn conflict(&self) -> Option<&Conflict> {
        match &self.result {
            SyncResult::Conflicted(conflict) => Some(conflict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Succeeded,
    PartiallyFailed,
}

/// Full accounting of one push cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PushReport {
    pub status: PushStatus,
    /// One entry per drained operation, in sequence order.
    pub outcomes: Vec<OperationOutcome>,
    /// Operations still queued in the pushed scope afterwards.
    pub remaining: i64,
    pub cancelled: bool,
}

impl PushReport {
    pub(crate) fn new(outcomes: Vec<OperationOutcome>, remaining: i64, cancelled: bool) -> Self {
        let status = if !cancelled && outcomes.iter().all(OperationOutcome::is_applied) {
            PushStatus::Succeeded
        } else {
            PushStatus::PartiallyFailed
        };
        Self {
            status,
            outcomes,
            remaining,
            cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PushStatus::Succeeded
    }

    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_applied()).count()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.outcomes.iter().filter_map(OperationOutcome::conflict)
    }

    /// Outcomes that were not applied, conflicts included.
    pub fn errors(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.outcomes.iter().filter(|o| !o.is_applied())
    }
}

/// Totals of one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub received: usize,
    pub upserted: usize,
    pub deleted: usize,
    /// Rows left alone because a local operation is pending for them.
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(seq: i64, result: SyncResult) -> OperationOutcome {
        OperationOutcome {
            seq,
            table: "items".to_string(),
            row_id: seq.to_string(),
            kind: OperationKind::Update,
            result,
        }
    }

    #[test]
    fn test_empty_push_succeeds() {
        let report = PushReport::new(Vec::new(), 0, false);
        assert!(report.is_success());
        assert_eq!(report.applied(), 0);
    }

    #[test]
    fn test_any_failure_is_partial() {
        let report = PushReport::new(
            vec![
                outcome(1, SyncResult::Applied { version: None }),
                outcome(
                    2,
                    SyncResult::Failed {
                        reason: "timeout".into(),
                        retryable: true,
                    },
                ),
            ],
            1,
            false,
        );
        assert_eq!(report.status, PushStatus::PartiallyFailed);
        assert_eq!(report.applied(), 1);
        assert_eq!(report.errors().count(), 1);
    }

    #[test]
    fn test_cancelled_is_partial() {
        let report = PushReport::new(
            vec![outcome(1, SyncResult::Applied { version: None })],
            3,
            true,
        );
        assert_eq!(report.status, PushStatus::PartiallyFailed);
    }
}
