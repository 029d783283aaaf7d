//! Integration tests for the orchestrator against the mock backend.

use driftsync_conflict::{ConflictStrategy, ResolutionAction};
use driftsync_core::Payload;
use driftsync_engine::{
    AdapterError, EngineConfig, EntityConfig, LocalReplica, ManualResolution, MemoryReplica, MockAdapter,
    MockOp, Orchestrator, OrchestratorState, SyncError, SyncEvent,
};
use driftsync_queue::{OperationKind, Priority, QueueConfig, RetryConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

struct Harness {
    engine: Orchestrator,
    adapter: Arc<MockAdapter>,
    replica: Arc<MemoryReplica>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_connected(true);
        let replica = Arc::new(MemoryReplica::new());
        let engine = Orchestrator::new(config, adapter.clone(), replica.clone());
        Self {
            engine,
            adapter,
            replica,
        }
    }

    fn register(&self, name: &str, config: EntityConfig) {
        self.engine.register_entity(name, config).unwrap();
    }

    /// Creates a record locally and syncs it.
    async fn seed(&self, collection: &str, id: &str, fields: Value) {
        self.replica.upsert_local(collection, id, payload(fields));
        self.engine.enqueue_record(collection, id).unwrap();
        let report = self.engine.process_pending().await.unwrap();
        assert_eq!(report.completed, 1);
    }
}

fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn fast_retries(max_attempts: u32) -> EngineConfig {
    EngineConfig::default().with_queue(
        QueueConfig::default().with_retry(
            RetryConfig::new(max_attempts)
                .with_base_delay(Duration::ZERO)
                .with_jitter_ratio(0.0),
        ),
    )
}

#[tokio::test]
async fn create_then_concurrent_edit_merges_fields() {
    let h = Harness::new();
    h.register("items", EntityConfig::new(Priority::Normal));
    let mut events = h.engine.subscribe();

    h.replica.upsert_local("items", "r1", payload(json!({"name": "A", "value": 1})));
    h.engine.enqueue_record("items", "r1").unwrap().unwrap();
    let report = h.engine.process_pending().await.unwrap();
    assert_eq!(report.completed, 1);

    let record = h.replica.read("items", "r1").unwrap().unwrap();
    assert!(!record.dirty);
    assert_eq!(record.sync_version, 1);
    assert!(!h.engine.queue().has_pending("items", "r1"));

    // Another client renames the record while we change its value.
    h.adapter.remote_write("items", "r1", payload(json!({"name": "B", "value": 1})));
    h.replica.upsert_local("items", "r1", payload(json!({"name": "A", "value": 2})));
    h.engine.enqueue_record("items", "r1").unwrap().unwrap();

    let report = h.engine.process_pending().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.completed, 1);

    let expected = payload(json!({"name": "B", "value": 2}));
    assert_eq!(h.adapter.stored("items", "r1").unwrap().payload, expected);
    let record = h.replica.read("items", "r1").unwrap().unwrap();
    assert_eq!(record.fields, expected);
    assert!(!record.dirty);

    let threshold = h.engine.registry().config().auto_merge_threshold;
    let resolved = drain(&mut events)
        .into_iter()
        .find_map(|event| match event {
            SyncEvent::ConflictResolved { action, confidence, .. } => Some((action, confidence)),
            _ => None,
        })
        .expect("conflict resolved event");
    assert_eq!(resolved.0, ResolutionAction::Merged);
    assert!(resolved.1 > threshold, "confidence {}", resolved.1);

    let stats = h.engine.stats();
    assert_eq!(stats.counters.conflicts_detected, 1);
    assert_eq!(stats.counters.conflicts_auto_resolved, 1);
}

#[tokio::test]
async fn transient_failures_retry_then_dead_letter() {
    let h = Harness::with_config(fast_retries(3));
    h.register("items", EntityConfig::default());
    h.adapter
        .push_failures(MockOp::Create, AdapterError::timeout("backend slow"), 5);

    h.replica.upsert_local("items", "r1", payload(json!({"name": "A"})));
    h.engine.enqueue_record("items", "r1").unwrap();
    let report = h.engine.process_pending().await.unwrap();

    assert_eq!(report.retried, 2);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.adapter.call_count(MockOp::Create), 3);

    let dead = h.engine.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert!(h.replica.read("items", "r1").unwrap().unwrap().dirty);
}

#[tokio::test]
async fn transient_failure_recovers() {
    let h = Harness::with_config(fast_retries(5));
    h.register("items", EntityConfig::default());
    h.adapter
        .push_failures(MockOp::Create, AdapterError::rate_limited("slow down"), 2);

    h.replica.upsert_local("items", "r1", payload(json!({"name": "A"})));
    h.engine.enqueue_record("items", "r1").unwrap();
    let report = h.engine.process_pending().await.unwrap();

    assert_eq!(report.retried, 2);
    assert_eq!(report.completed, 1);
    assert!(h.engine.dead_letters().is_empty());
    assert!(h.adapter.stored("items", "r1").is_some());
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let h = Harness::with_config(fast_retries(5));
    h.register("items", EntityConfig::default());
    h.adapter
        .push_failure(MockOp::Create, AdapterError::validation("name too long"));

    h.replica.upsert_local("items", "r1", payload(json!({"name": "A"})));
    h.engine.enqueue_record("items", "r1").unwrap();
    let report = h.engine.process_pending().await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(h.adapter.call_count(MockOp::Create), 1);

    // A dead letter can be given a fresh start.
    let dead = h.engine.dead_letters();
    h.engine.requeue_dead_letter(dead[0].id).unwrap();
    let report = h.engine.process_pending().await.unwrap();
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn manual_strategy_parks_until_operator_decides() {
    let h = Harness::new();
    h.register(
        "notes",
        EntityConfig::new(Priority::High).with_conflict_strategy(ConflictStrategy::Manual),
    );
    h.seed("notes", "n1", json!({"title": "draft"})).await;

    h.adapter.remote_write("notes", "n1", payload(json!({"title": "theirs"})));
    h.replica.upsert_local("notes", "n1", payload(json!({"title": "ours"})));
    h.engine.enqueue_record("notes", "n1").unwrap();

    let report = h.engine.process_pending().await.unwrap();
    assert_eq!(report.parked, 1);
    let parked = h.engine.parked_conflicts();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].case.remote["title"], "theirs");
    assert!(h.engine.queue().has_pending("notes", "n1"));

    // Later edits to the record wait behind the parked item.
    h.replica.upsert_local("notes", "n1", payload(json!({"title": "ours, again"})));
    assert_eq!(h.engine.sync_dirty("notes").unwrap(), 0);

    h.engine
        .resolve_parked(parked[0].item_id, ManualResolution::UsePayload(payload(json!({"title": "agreed"}))))
        .unwrap();
    let report = h.engine.process_pending().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(h.adapter.stored("notes", "n1").unwrap().payload["title"], "agreed");
    assert!(h.engine.parked_conflicts().is_empty());
    assert!(!h.replica.read("notes", "n1").unwrap().unwrap().dirty);
}

#[tokio::test]
async fn keep_remote_discards_local_change() {
    let h = Harness::new();
    h.register(
        "notes",
        EntityConfig::default().with_conflict_strategy(ConflictStrategy::Manual),
    );
    h.seed("notes", "n1", json!({"title": "draft"})).await;
    let remote = h.adapter.remote_write("notes", "n1", payload(json!({"title": "theirs"})));
    h.replica.upsert_local("notes", "n1", payload(json!({"title": "ours"})));
    h.engine.enqueue_record("notes", "n1").unwrap();
    h.engine.process_pending().await.unwrap();

    let parked = h.engine.parked_conflicts();
    h.engine
        .resolve_parked(parked[0].item_id, ManualResolution::KeepRemote)
        .unwrap();

    let record = h.replica.read("notes", "n1").unwrap().unwrap();
    assert_eq!(record.fields, remote.payload);
    assert!(!record.dirty);
    assert_eq!(
        h.replica.last_synced("notes", "n1").unwrap().unwrap().remote_version,
        remote.version
    );
    assert!(!h.engine.queue().has_pending("notes", "n1"));

    let err = h
        .engine
        .resolve_parked(parked[0].item_id, ManualResolution::KeepRemote)
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
}

#[tokio::test]
async fn delete_after_remote_change_is_parked() {
    let h = Harness::new();
    h.register("notes", EntityConfig::default());
    h.seed("notes", "n1", json!({"title": "draft"})).await;

    h.adapter.remote_write("notes", "n1", payload(json!({"title": "edited elsewhere"})));
    h.replica.delete_local("notes", "n1");
    h.engine.enqueue_record("notes", "n1").unwrap();

    let report = h.engine.process_pending().await.unwrap();
    assert_eq!(report.parked, 1);
    assert!(h.adapter.stored("notes", "n1").is_some());

    let parked = h.engine.parked_conflicts();
    h.engine
        .resolve_parked(parked[0].item_id, ManualResolution::Delete)
        .unwrap();
    let report = h.engine.process_pending().await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(h.adapter.stored("notes", "n1").is_none());
    assert!(h.replica.read("notes", "n1").unwrap().is_none());
}

#[tokio::test]
async fn remote_wins_strategy_adopts_remote() {
    let h = Harness::new();
    h.register(
        "settings",
        EntityConfig::default().with_conflict_strategy(ConflictStrategy::RemoteWins),
    );
    h.seed("settings", "s1", json!({"theme": "light"})).await;
    h.adapter.remote_write("settings", "s1", payload(json!({"theme": "dark"})));
    h.replica.upsert_local("settings", "s1", payload(json!({"theme": "solarized"})));
    h.engine.enqueue_record("settings", "s1").unwrap();

    let report = h.engine.process_pending().await.unwrap();
    assert_eq!(report.completed, 1);
    let record = h.replica.read("settings", "s1").unwrap().unwrap();
    assert_eq!(record.fields["theme"], "dark");
    assert!(!record.dirty);
    // Only the conflicting attempt reached the backend.
    assert_eq!(h.adapter.call_count(MockOp::Update), 1);
}

#[tokio::test]
async fn patch_capable_backend_receives_deltas() {
    let adapter = Arc::new(MockAdapter::new().with_patch_support());
    adapter.set_connected(true);
    let replica = Arc::new(MemoryReplica::new());
    let engine = Orchestrator::new(EngineConfig::default(), adapter.clone(), replica.clone());
    engine.register_entity("docs", EntityConfig::default()).unwrap();

    replica.upsert_local("docs", "d1", payload(json!({"title": "a", "body": "long text"})));
    engine.enqueue_record("docs", "d1").unwrap();
    engine.process_pending().await.unwrap();

    replica.upsert_local("docs", "d1", payload(json!({"title": "b", "body": "long text"})));
    engine.enqueue_record("docs", "d1").unwrap();
    let report = engine.process_pending().await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(adapter.call_count(MockOp::Patch), 1);
    assert_eq!(adapter.call_count(MockOp::Update), 0);
    assert_eq!(adapter.stored("docs", "d1").unwrap().payload["title"], "b");
}

#[tokio::test]
async fn batches_isolate_failures() {
    let h = Harness::with_config(fast_retries(1));
    h.register("items", EntityConfig::default());
    h.adapter
        .push_failure(MockOp::Create, AdapterError::permanent("quota exceeded"));

    for n in 0..6 {
        h.replica
            .upsert_local("items", &format!("r{n}"), payload(json!({"n": n})));
    }
    assert_eq!(h.engine.sync_dirty("items").unwrap(), 6);
    let report = h.engine.process_pending().await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.completed, 5);
    assert_eq!(h.adapter.stored_count("items"), 5);
    assert!(h.engine.stats().batch_error_rate.is_some());
}

#[tokio::test]
async fn pull_applies_remote_state_and_merges_local_edits() {
    let h = Harness::new();
    h.register("items", EntityConfig::default());
    h.seed("items", "kept", json!({"name": "A", "value": 1})).await;
    h.seed("items", "gone", json!({"name": "G"})).await;
    h.seed("items", "plain", json!({"name": "P"})).await;

    h.adapter.remote_write("items", "fresh", payload(json!({"name": "F"})));
    h.adapter.remote_write("items", "kept", payload(json!({"name": "B", "value": 1})));
    h.adapter.remote_write("items", "plain", payload(json!({"name": "P2"})));
    h.adapter.remote_delete("items", "gone");
    // Unpushed local edit on a record that also changed remotely.
    h.replica.upsert_local("items", "kept", payload(json!({"name": "A", "value": 2})));

    let report = h.engine.pull_collection("items").await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.removed, 1);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.unresolved, 0);

    assert_eq!(h.replica.read("items", "fresh").unwrap().unwrap().fields["name"], "F");
    assert_eq!(h.replica.read("items", "plain").unwrap().unwrap().fields["name"], "P2");
    assert!(h.replica.read("items", "gone").unwrap().is_none());

    let kept = h.replica.read("items", "kept").unwrap().unwrap();
    assert_eq!(kept.fields, payload(json!({"name": "B", "value": 2})));
    assert!(kept.dirty);

    // The merged record now pushes cleanly against the pulled version.
    assert_eq!(h.engine.sync_dirty("items").unwrap(), 1);
    let pushed = h.engine.process_pending().await.unwrap();
    assert_eq!(pushed.completed, 1);
    assert_eq!(
        h.adapter.stored("items", "kept").unwrap().payload,
        payload(json!({"name": "B", "value": 2}))
    );
}

#[tokio::test]
async fn manual_trigger_enqueues_dirty_records() {
    let h = Harness::new();
    h.register("items", EntityConfig::default());
    h.replica.upsert_local("items", "r1", payload(json!({"name": "A"})));
    h.replica.upsert_local("items", "r2", payload(json!({"name": "B"})));

    let mut events = h.engine.subscribe();
    h.engine.trigger_sync("items").unwrap();
    assert_eq!(h.engine.run_due().await.unwrap(), 1);
    assert_eq!(h.engine.queue().len(), 2);

    let fired = drain(&mut events)
        .into_iter()
        .any(|event| matches!(event, SyncEvent::ScheduleFired { entity, .. } if entity == "items"));
    assert!(fired);

    let err = h.engine.trigger_sync("unknown").unwrap_err();
    assert_eq!(err, SyncError::NotRegistered("unknown".into()));
}

#[tokio::test]
async fn events_describe_each_operation() {
    let h = Harness::new();
    h.register("items", EntityConfig::default());
    let mut events = h.engine.subscribe();
    h.seed("items", "r1", json!({"name": "A"})).await;

    let events = drain(&mut events);
    let started = events.iter().position(|e| matches!(e, SyncEvent::OperationStarted { kind: OperationKind::Create, .. }));
    let completed = events
        .iter()
        .position(|e| matches!(e, SyncEvent::OperationCompleted { success: true, .. }));
    assert!(started.is_some());
    assert!(started < completed);
}

#[tokio::test]
async fn running_orchestrator_syncs_in_background() {
    let h = Harness::with_config(EngineConfig::default().with_tick(Duration::from_millis(20)));
    h.adapter.set_connected(false);
    h.register("items", EntityConfig::default());
    h.engine.start().await.unwrap();
    assert_eq!(h.engine.state(), OrchestratorState::Running);
    assert!(h.adapter.is_connected());
    assert!(h.engine.start().await.is_err());

    h.replica.upsert_local("items", "r1", payload(json!({"name": "A"})));
    h.engine.enqueue_record("items", "r1").unwrap();

    let synced = tokio::time::timeout(Duration::from_secs(5), async {
        while h.adapter.stored("items", "r1").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(synced.is_ok(), "record never reached the backend");

    h.engine.stop().await;
    assert_eq!(h.engine.state(), OrchestratorState::Stopped);
    assert!(!h.adapter.is_connected());
}

#[tokio::test]
async fn stopped_orchestrator_rejects_work() {
    let h = Harness::new();
    h.register("items", EntityConfig::default());
    h.engine.start().await.unwrap();
    h.engine.stop().await;

    let err = h
        .engine
        .enqueue_mutation("items", "r1", OperationKind::Create, Some(payload(json!({"a": 1}))))
        .unwrap_err();
    assert_eq!(err, SyncError::Stopped);
    assert_eq!(h.engine.process_pending().await.unwrap_err(), SyncError::Stopped);
    assert!(h.engine.start().await.is_err());
    // Stopping twice is harmless.
    h.engine.stop().await;
}

#[tokio::test]
async fn remote_watch_reports_changes() {
    let h = Harness::new();
    h.register("items", EntityConfig::default());
    let mut events = h.engine.subscribe();
    h.engine.watch_remote("items").await.unwrap();
    assert_eq!(h.adapter.subscriber_count(), 1);

    h.adapter.remote_write("items", "r9", payload(json!({"name": "Z"})));

    let change = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::RemoteChanged { record_id, kind, .. }) => return (record_id, kind),
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("remote change event");
    assert_eq!(change, ("r9".to_string(), OperationKind::Create));

    h.engine.stop().await;
    assert_eq!(h.adapter.subscriber_count(), 0);
}
