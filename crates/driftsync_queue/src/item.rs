//! Queue items and their status state machine.

use chrono::{DateTime, Utc};
use driftsync_core::{DeltaPatch, Payload, RecordId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Queue item identifier.
pub type ItemId = Uuid;

/// Priority tier, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// User-blocking writes.
    Critical,
    /// Interactive writes.
    High,
    /// Ordinary background sync.
    #[default]
    Normal,
    /// Bulk replication.
    Low,
}

impl Priority {
    /// All tiers in dispatch order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Position in dispatch order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Returns true if `self` is dispatched before `other`.
    pub fn outranks(self, other: Priority) -> bool {
        self < other
    }

    /// Name of the tier.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Kind of remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a record.
    Create,
    /// Update an existing record.
    Update,
    /// Delete a record.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Body carried by a queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OperationPayload {
    /// The full record payload.
    Full(Payload),
    /// A delta against the last confirmed version.
    Delta(DeltaPatch),
    /// No body (deletes).
    Empty,
}

impl OperationPayload {
    /// Returns true for delta bodies.
    pub fn is_delta(&self) -> bool {
        matches!(self, OperationPayload::Delta(_))
    }
}

/// Status of a queue item.
///
/// ```text
/// queued -> admitted -> in_flight -> completed
///                                 -> conflicted -> queued | parked
///                                 -> failed -> retry_wait -> queued
///                                           -> dead_lettered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting in its tier.
    Queued,
    /// Selected for dispatch.
    Admitted,
    /// Holding a tier permit, adapter call in progress.
    InFlight,
    /// Confirmed by the backend. Terminal.
    Completed,
    /// Rejected as stale; awaiting resolution.
    Conflicted,
    /// The last attempt failed.
    Failed,
    /// Waiting for its backoff to elapse.
    RetryWait,
    /// Quarantined. Terminal.
    DeadLettered,
    /// Awaiting manual conflict resolution.
    Parked,
}

impl ItemStatus {
    /// Returns true for terminal statuses.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::DeadLettered)
    }

    /// Returns true if the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Queued, Admitted)
                | (Queued, DeadLettered)
                | (Admitted, InFlight)
                | (InFlight, Completed)
                | (InFlight, Conflicted)
                | (InFlight, Failed)
                | (Conflicted, Queued)
                | (Conflicted, Parked)
                | (Failed, RetryWait)
                | (Failed, DeadLettered)
                | (RetryWait, Queued)
                | (Parked, Queued)
                | (Parked, DeadLettered)
        )
    }
}

/// A pending unit of sync work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Item ID.
    pub id: ItemId,
    /// Collection (entity) name.
    pub collection: String,
    /// Target record.
    pub record_id: RecordId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Operation body.
    pub payload: OperationPayload,
    /// Priority tier.
    pub priority: Priority,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Conflict resolutions so far.
    pub conflicts: u32,
    /// Current status.
    pub status: ItemStatus,
    /// Enqueue order, assigned by the queue.
    pub sequence: u64,
    /// Enqueue time.
    pub enqueued_at: DateTime<Utc>,
    /// Last admission time.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Reason for the last failure, park or dead-letter.
    pub last_error: Option<String>,
    /// Earliest retry time while in retry-wait.
    #[serde(skip)]
    pub ready_at: Option<Instant>,
}

impl QueueItem {
    /// Creates a queued item at normal priority.
    pub fn new(
        collection: impl Into<String>,
        record_id: impl Into<RecordId>,
        kind: OperationKind,
        payload: OperationPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection: collection.into(),
            record_id: record_id.into(),
            kind,
            payload,
            priority: Priority::Normal,
            attempts: 0,
            conflicts: 0,
            status: ItemStatus::Queued,
            sequence: 0,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
            last_error: None,
            ready_at: None,
        }
    }

    /// Sets the priority tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Checks that the item is well formed.
    pub fn validate(&self) -> QueueResult<()> {
        if self.collection.trim().is_empty() {
            return Err(QueueError::InvalidItem("collection is empty".into()));
        }
        if self.record_id.trim().is_empty() {
            return Err(QueueError::InvalidItem("record id is empty".into()));
        }
        match (self.kind, &self.payload) {
            (OperationKind::Create, OperationPayload::Full(_)) => Ok(()),
            (OperationKind::Create, _) => Err(QueueError::InvalidItem(
                "create requires a full payload".into(),
            )),
            (OperationKind::Update, OperationPayload::Empty) => {
                Err(QueueError::InvalidItem("update requires a payload".into()))
            }
            _ => Ok(()),
        }
    }

    /// Moves to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: ItemStatus) -> QueueResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record key used for per-record ordering.
    pub fn record_key(&self) -> (String, RecordId) {
        (self.collection.clone(), self.record_id.clone())
    }
}
