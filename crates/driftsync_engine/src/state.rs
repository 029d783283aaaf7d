//! Orchestrator lifecycle state and statistics.

use driftsync_queue::QueueStats;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Created, worker loops not running. Work can still be driven with
    /// `process_pending`.
    Idle,
    /// Worker loops running.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped for good.
    Stopped,
}

impl OrchestratorState {
    /// Returns true if the worker loops can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, OrchestratorState::Idle)
    }

    /// Returns true if new work is accepted.
    pub fn accepts_work(&self) -> bool {
        matches!(self, OrchestratorState::Idle | OrchestratorState::Running)
    }

    /// Returns true while the worker loops run.
    pub fn is_running(&self) -> bool {
        matches!(self, OrchestratorState::Running)
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Running => "running",
            OrchestratorState::Stopping => "stopping",
            OrchestratorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Cumulative counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCounters {
    /// Operations accepted by the backend.
    pub completed: u64,
    /// Failed attempts that were scheduled for retry.
    pub retried: u64,
    /// Operations dead-lettered.
    pub dead_lettered: u64,
    /// Version conflicts seen, on push or pull.
    pub conflicts_detected: u64,
    /// Conflicts resolved without an operator.
    pub conflicts_auto_resolved: u64,
    /// Conflicts parked for an operator.
    pub conflicts_parked: u64,
    /// Records written locally by pulls.
    pub pulled: u64,
    /// Scheduler triggers handled.
    pub schedule_fired: u64,
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Lifecycle state.
    pub state: OrchestratorState,
    /// Queue snapshot.
    pub queue: QueueStats,
    /// Cumulative counters.
    pub counters: SyncCounters,
    /// Parked conflicts awaiting an operator.
    pub parked_conflicts: usize,
    /// Failure rate over recent batches.
    pub batch_error_rate: Option<f64>,
    /// Registered entities.
    pub entities: usize,
}

/// Tally of one `process_pending` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    /// Operations accepted by the backend.
    pub completed: usize,
    /// Conflicts resolved and re-queued with a merged body.
    pub requeued: usize,
    /// Conflicts parked for an operator.
    pub parked: usize,
    /// Failed attempts scheduled for retry.
    pub retried: usize,
    /// Operations dead-lettered.
    pub dead_lettered: usize,
}

/// Tally of one `pull_collection` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    /// Remote records written locally.
    pub applied: usize,
    /// Local records removed because the backend no longer has them.
    pub removed: usize,
    /// Conflicts with unpushed local edits resolved automatically.
    pub resolved: usize,
    /// Conflicts left for the push path.
    pub unresolved: usize,
    /// Records skipped because operations on them are queued.
    pub skipped: usize,
}

impl ProcessReport {
    /// Operations dispatched in the pass.
    pub fn dispatched(&self) -> usize {
        self.completed + self.requeued + self.parked + self.retried + self.dead_lettered
    }
}
