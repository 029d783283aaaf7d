//! Simulate command implementation.
//!
//! Creates records locally, pushes them to the in-memory backend, then
//! edits them again while the "server" changes some of them concurrently
//! and drops some updates, and reports how the engine converged.

use driftsync_core::payload_from_value;
use driftsync_engine::{
    AdapterError, AdapterErrorKind, EngineConfig, EntityConfig, LocalReplica, MemoryReplica, MockAdapter, MockOp,
    Orchestrator, ProcessReport,
};
use driftsync_queue::{Priority, QueueConfig, RetryConfig};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::CommandResult;

const COLLECTION: &str = "items";
const MAX_ROUNDS: usize = 16;

/// Options for a simulated session.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Records to create and edit.
    pub records: usize,
    /// Every Nth record gets a concurrent remote edit; 0 disables.
    pub conflict_every: usize,
    /// Every Nth update fails once; 0 disables.
    pub fail_every: usize,
    /// Attempts before dead-lettering.
    pub max_attempts: u32,
}

/// Summary of a simulated session.
#[derive(Debug, Serialize)]
pub struct SimulateSummary {
    /// Records simulated.
    pub records: usize,
    /// Concurrent remote edits injected.
    pub conflicts_injected: usize,
    /// Update failures injected.
    pub failures_injected: usize,
    /// Tally of the initial push.
    pub initial_push: ProcessReport,
    /// Tally of the edit round, summed over passes.
    pub edit_round: ProcessReport,
    /// Passes needed to drain the edit round.
    pub passes: usize,
    /// Records whose local and remote copies match.
    pub converged: usize,
    /// Conflicts left for an operator.
    pub parked: usize,
    /// Operations dead-lettered.
    pub dead_letters: usize,
    /// Engine statistics at the end.
    pub stats: Value,
}

/// Runs the simulate command.
pub fn run(options: &SimulateOptions) -> CommandResult<Value> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let summary = runtime.block_on(simulate(options))?;
    Ok(serde_json::to_value(summary)?)
}

/// Runs a simulated session.
pub async fn simulate(options: &SimulateOptions) -> CommandResult<SimulateSummary> {
    let retry = RetryConfig::new(options.max_attempts.max(1))
        .with_base_delay(Duration::ZERO)
        .with_jitter_ratio(0.0);
    let config = EngineConfig::default().with_queue(QueueConfig::default().with_retry(retry));
    let adapter = Arc::new(MockAdapter::new());
    let replica = Arc::new(MemoryReplica::new());
    let engine = Orchestrator::new(config, adapter.clone(), replica.clone());
    engine.register_entity(COLLECTION, EntityConfig::new(Priority::Normal))?;

    let ids: Vec<String> = (0..options.records).map(|n| format!("item-{n:04}")).collect();
    for (n, id) in ids.iter().enumerate() {
        let fields = payload_from_value(json!({"title": format!("Item {n}"), "count": 0}))?;
        replica.upsert_local(COLLECTION, id, fields);
    }
    engine.sync_dirty(COLLECTION)?;
    let initial_push = engine.process_pending().await?;
    tracing::info!(completed = initial_push.completed, "initial push finished");

    let mut conflicts_injected = 0;
    let mut failures_injected = 0;
    for (n, id) in ids.iter().enumerate() {
        let Some(mut record) = replica.read(COLLECTION, id)? else {
            continue;
        };
        record.set_field("count", Value::from(n as u64 + 1));
        replica.upsert_local(COLLECTION, id, record.fields.clone());

        if every(options.conflict_every, n) {
            if let Some(remote) = adapter.stored(COLLECTION, id) {
                let mut payload = remote.payload;
                payload.insert("title".into(), Value::String(format!("Item {n} (edited remotely)")));
                adapter.remote_write(COLLECTION, id, payload);
                conflicts_injected += 1;
            }
        }
        if every(options.fail_every, n) {
            adapter.push_failure(
                MockOp::Update,
                AdapterError::new(AdapterErrorKind::Transient, "simulated outage"),
            );
            failures_injected += 1;
        }
    }
    engine.sync_dirty(COLLECTION)?;

    let mut edit_round = ProcessReport::default();
    let mut passes = 0;
    while passes < MAX_ROUNDS {
        let report = engine.process_pending().await?;
        if report.dispatched() == 0 {
            break;
        }
        passes += 1;
        edit_round.completed += report.completed;
        edit_round.requeued += report.requeued;
        edit_round.parked += report.parked;
        edit_round.retried += report.retried;
        edit_round.dead_lettered += report.dead_lettered;
    }

    let mut converged = 0;
    for id in &ids {
        let local = replica.read(COLLECTION, id)?;
        let remote = adapter.stored(COLLECTION, id);
        if let (Some(local), Some(remote)) = (local, remote) {
            if local.fields == remote.payload {
                converged += 1;
            }
        }
    }
    tracing::info!(converged, records = ids.len(), passes, "simulation finished");

    Ok(SimulateSummary {
        records: ids.len(),
        conflicts_injected,
        failures_injected,
        initial_push,
        edit_round,
        passes,
        converged,
        parked: engine.parked_conflicts().len(),
        dead_letters: engine.dead_letters().len(),
        stats: serde_json::to_value(engine.stats())?,
    })
}

fn every(k: usize, n: usize) -> bool {
    k > 0 && n % k == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(records: usize, conflict_every: usize, fail_every: usize) -> SimulateOptions {
        SimulateOptions {
            records,
            conflict_every,
            fail_every,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn clean_session_converges() {
        let summary = simulate(&options(6, 0, 0)).await.unwrap();
        assert_eq!(summary.initial_push.completed, 6);
        assert_eq!(summary.edit_round.completed, 6);
        assert_eq!(summary.converged, 6);
        assert_eq!(summary.dead_letters, 0);
    }

    #[tokio::test]
    async fn conflicts_and_failures_still_converge() {
        let summary = simulate(&options(8, 2, 3)).await.unwrap();
        assert_eq!(summary.conflicts_injected, 4);
        assert_eq!(summary.failures_injected, 3);
        assert_eq!(summary.edit_round.requeued, 4);
        assert_eq!(summary.edit_round.retried, 3);
        assert_eq!(summary.parked, 0);
        assert_eq!(summary.dead_letters, 0);
        assert_eq!(summary.converged, 8);
    }

    #[test]
    fn run_returns_json() {
        let output = run(&options(2, 0, 0)).unwrap();
        assert_eq!(output["records"], 2);
        assert_eq!(output["converged"], 2);
    }
}
