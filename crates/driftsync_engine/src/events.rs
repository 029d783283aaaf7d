//! Event surface.
//!
//! Events are informational. Nothing in the engine depends on anyone
//! listening, and a lagging receiver only loses its own backlog.

use driftsync_conflict::ResolutionAction;
use driftsync_core::RecordId;
use driftsync_queue::{ItemId, OperationKind, Priority};
use driftsync_scheduler::TriggerReason;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::state::OrchestratorState;

/// Queue-level change reported by [`SyncEvent::QueueStatusChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueChange {
    /// Admissions paused.
    Paused,
    /// Admissions resumed.
    Resumed,
    /// Tier caps rebalanced under backlog.
    Overloaded,
    /// Base tier caps restored.
    Restored,
    /// All queued work dropped.
    Cleared,
    /// A lower-priority item was evicted to make room.
    Evicted,
}

/// Something the engine did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// An operation was handed to the backend.
    OperationStarted {
        /// Queue item.
        item_id: ItemId,
        /// Collection.
        collection: String,
        /// Record.
        record_id: RecordId,
        /// Operation kind.
        kind: OperationKind,
        /// Failed attempts before this one.
        attempt: u32,
    },
    /// An operation finished, successfully or not.
    OperationCompleted {
        /// Queue item.
        item_id: ItemId,
        /// Collection.
        collection: String,
        /// Record.
        record_id: RecordId,
        /// Whether the backend accepted it.
        success: bool,
        /// Failure reason.
        error: Option<String>,
        /// Backoff before the next attempt, if one is scheduled.
        retry_in_ms: Option<u64>,
    },
    /// An operation gave up and was dead-lettered.
    DeadLettered {
        /// Queue item.
        item_id: ItemId,
        /// Collection.
        collection: String,
        /// Record.
        record_id: RecordId,
        /// Last failure reason.
        reason: String,
    },
    /// Local and remote versions diverged.
    ConflictDetected {
        /// Conflict case.
        case_id: Uuid,
        /// Queue item that hit the conflict, if any.
        item_id: Option<ItemId>,
        /// Collection.
        collection: String,
        /// Record.
        record_id: RecordId,
        /// Number of diverging fields.
        fields: usize,
    },
    /// A conflict was resolved.
    ConflictResolved {
        /// Conflict case.
        case_id: Uuid,
        /// Collection.
        collection: String,
        /// Record.
        record_id: RecordId,
        /// Resolver that produced the result.
        resolver: String,
        /// What the resolution does.
        action: ResolutionAction,
        /// Resolution confidence.
        confidence: f64,
    },
    /// A conflict needs an operator.
    ConflictParked {
        /// Conflict case.
        case_id: Uuid,
        /// Parked queue item.
        item_id: ItemId,
        /// Collection.
        collection: String,
        /// Record.
        record_id: RecordId,
    },
    /// The queue changed state.
    QueueStatusChanged {
        /// What changed.
        change: QueueChange,
        /// Items waiting for admission.
        queued: usize,
        /// Items in flight.
        in_flight: usize,
    },
    /// The scheduler fired for an entity.
    ScheduleFired {
        /// Entity name.
        entity: String,
        /// Why it fired.
        reason: TriggerReason,
        /// Entity priority.
        priority: Priority,
    },
    /// The backend reported a change.
    RemoteChanged {
        /// Collection.
        collection: String,
        /// Record.
        record_id: RecordId,
        /// Change kind.
        kind: OperationKind,
    },
    /// A pull finished.
    PullCompleted {
        /// Collection.
        collection: String,
        /// Records written locally.
        applied: usize,
        /// Records removed locally.
        removed: usize,
        /// Conflicts resolved automatically.
        resolved: usize,
        /// Conflicts left for the push path.
        unresolved: usize,
    },
    /// The orchestrator changed state.
    StateChanged {
        /// Previous state.
        from: OrchestratorState,
        /// New state.
        to: OrchestratorState,
    },
}

/// Broadcast channel for [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a bus keeping up to `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Emits an event. Having no receivers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.receiver_count(), 1);

        bus.emit(SyncEvent::ScheduleFired {
            entity: "notes".into(),
            reason: TriggerReason::Manual,
            priority: Priority::High,
        });
        match rx.recv().await.unwrap() {
            SyncEvent::ScheduleFired { entity, .. } => assert_eq!(entity, "notes"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emitting_without_receivers_is_fine() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::StateChanged {
            from: OrchestratorState::Idle,
            to: OrchestratorState::Running,
        });
    }

    #[test]
    fn serde_shape() {
        let event = SyncEvent::QueueStatusChanged {
            change: QueueChange::Paused,
            queued: 3,
            in_flight: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "queue_status_changed");
        assert_eq!(json["change"], "paused");
    }
}
