//! The sync orchestrator.
//!
//! Owns the queue, scheduler, resolver registry and batch executor, and
//! wires them to a [`BackendAdapter`] and a [`LocalReplica`]:
//!
//! ```text
//! local edit ──> enqueue ──> PriorityQueue ──> dispatch ──> BackendAdapter
//!                   ^              ^               │
//!                   │              │ requeue       │ conflict
//!  AdaptiveScheduler ── sync_dirty │               v
//!                                  └──── ResolverRegistry
//! ```
//!
//! Work can be driven two ways. [`Orchestrator::start`] spawns a dispatch
//! loop and a scheduler loop on the current tokio runtime. Without starting,
//! [`Orchestrator::process_pending`] and [`Orchestrator::run_due`] drive the
//! same paths on demand.

use chrono::Utc;
use driftsync_conflict::{
    ConflictCase, ConflictStrategy, EnhancedResolution, FieldMergeResolver, ResolutionAction,
    ResolutionOutcome, ResolverRegistry,
};
use driftsync_core::{apply_delta, calculate_collection_delta, calculate_delta, Payload, Record, RecordId};
use driftsync_queue::{
    FailOutcome, ItemId, OperationKind, OperationPayload, PriorityQueue, QueueItem, RebalanceChange,
};
use driftsync_scheduler::{AdaptiveScheduler, ScheduleTrigger, SyncOutcome, SystemConditions};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::adapter::{
    AdapterError, AdapterErrorKind, BackendAdapter, Query, RemoteRecord, SubscribeOptions, Subscription,
    SubscriptionId,
};
use crate::batch::{BatchExecutor, BatchOutcome};
use crate::config::{EngineConfig, EntityConfig};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, QueueChange, SyncEvent};
use crate::replica::{LocalReplica, SyncedSnapshot};
use crate::state::{EngineStats, OrchestratorState, ProcessReport, PullReport, SyncCounters};

/// Resolver name reported for operator decisions.
const OPERATOR: &str = "operator";

/// Shortest pause of the scheduler loop between polls.
const MIN_SCHEDULER_WAIT: Duration = Duration::from_millis(10);

/// A conflict waiting for an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedConflict {
    /// Parked queue item.
    pub item_id: ItemId,
    /// The conflict.
    pub case: ConflictCase,
    /// Suggested resolution, when a resolver ran.
    pub resolution: Option<EnhancedResolution>,
    /// Remote version at detection.
    pub remote_version: u64,
}

/// Operator decision for a parked conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualResolution {
    /// Push this payload.
    UsePayload(Payload),
    /// Drop the local change and adopt the remote state.
    KeepRemote,
    /// Delete the record remotely.
    Delete,
}

/// What one dispatch did to its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Completed,
    Requeued,
    Parked,
    Retried,
    DeadLettered,
    /// The queue rejected the transition; the item was logged and dropped
    /// from this pass.
    Abandoned,
}

impl BatchOutcome for ItemOutcome {
    fn is_failure(&self) -> bool {
        matches!(
            self,
            ItemOutcome::Retried | ItemOutcome::DeadLettered | ItemOutcome::Abandoned
        )
    }
}

/// What the backend accepted.
enum Sent {
    Written { sent: Payload, remote: RemoteRecord },
    Deleted,
}

/// Why a send failed.
enum Failure {
    Adapter(AdapterError),
    /// The item cannot be sent as-is.
    Invalid(String),
    /// The replica could not be read.
    Replica(String),
}

impl From<AdapterError> for Failure {
    fn from(err: AdapterError) -> Self {
        Failure::Adapter(err)
    }
}

struct Inner {
    config: EngineConfig,
    adapter: Arc<dyn BackendAdapter>,
    replica: Arc<dyn LocalReplica>,
    queue: PriorityQueue,
    scheduler: AdaptiveScheduler,
    registry: ResolverRegistry,
    batch: BatchExecutor,
    events: EventBus,
    entities: RwLock<HashMap<String, EntityConfig>>,
    state: RwLock<OrchestratorState>,
    counters: RwLock<SyncCounters>,
    /// Resolutions whose merged payload is queued, keyed by item.
    resolutions: Mutex<HashMap<ItemId, (ConflictCase, EnhancedResolution)>>,
    parked: Mutex<HashMap<ItemId, ParkedConflict>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

/// Coordinates delta encoding, queueing, conflict resolution and
/// scheduling for a set of entities.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Creates an orchestrator. Nothing runs until [`start`](Self::start)
    /// or [`process_pending`](Self::process_pending).
    pub fn new(config: EngineConfig, adapter: Arc<dyn BackendAdapter>, replica: Arc<dyn LocalReplica>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Inner {
            queue: PriorityQueue::new(config.queue.clone()),
            scheduler: AdaptiveScheduler::new(config.scheduler.clone()),
            registry: ResolverRegistry::new(config.resolver.clone()),
            batch: BatchExecutor::new(config.batch.clone()),
            events: EventBus::new(config.event_capacity),
            config,
            adapter,
            replica,
            entities: RwLock::new(HashMap::new()),
            state: RwLock::new(OrchestratorState::Idle),
            counters: RwLock::new(SyncCounters::default()),
            resolutions: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
            shutdown,
            workers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OrchestratorState {
        *self.inner.state.read()
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// The operation queue.
    pub fn queue(&self) -> &PriorityQueue {
        &self.inner.queue
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.inner.scheduler
    }

    /// The resolver registry.
    pub fn registry(&self) -> &ResolverRegistry {
        &self.inner.registry
    }

    /// The batch executor.
    pub fn batch_executor(&self) -> &BatchExecutor {
        &self.inner.batch
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Registers an entity, replacing any previous registration.
    pub fn register_entity(&self, name: impl Into<String>, config: EntityConfig) -> SyncResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SyncError::Validation("entity name is empty".into()));
        }
        self.ensure_accepting()?;

        let scheduler = &self.inner.scheduler;
        if scheduler.is_registered(&name) {
            scheduler.unregister(&name);
        }
        scheduler.register(name.clone(), config.schedule_options(), Utc::now())?;
        self.configure_resolver(&name, &config);

        tracing::info!(
            entity = %name,
            priority = %config.priority,
            strategy = ?config.conflict_strategy,
            "entity registered"
        );
        self.inner.entities.write().insert(name, config);
        Ok(())
    }

    /// Configuration of a registered entity.
    pub fn entity(&self, name: &str) -> Option<EntityConfig> {
        self.inner.entities.read().get(name).cloned()
    }

    /// Names of registered entities, sorted.
    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.entities.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn configure_resolver(&self, name: &str, config: &EntityConfig) {
        let registry = &self.inner.registry;
        match config.conflict_strategy {
            ConflictStrategy::FieldMerge if !config.critical_fields.is_empty() => {
                let mut resolver_config = registry.config().clone();
                resolver_config
                    .critical_fields
                    .extend(config.critical_fields.iter().cloned());
                let resolver =
                    FieldMergeResolver::new(resolver_config).with_history(Arc::clone(registry.history()));
                registry.set_override(name, Arc::new(resolver));
            }
            ConflictStrategy::FieldMerge => {
                registry.clear_override(name);
            }
            strategy => registry.set_strategy(name, strategy),
        }
    }

    // =========================================================================
    // Enqueueing
    // =========================================================================

    /// Enqueues a prepared item for a registered entity.
    pub fn enqueue(&self, item: QueueItem) -> SyncResult<ItemId> {
        self.ensure_accepting()?;
        self.entity_config(&item.collection)?;
        let collection = item.collection.clone();
        let id = self.push(item)?;
        self.inner.scheduler.notify_data_change(&collection, Utc::now())?;
        Ok(id)
    }

    /// Enqueues a local mutation.
    ///
    /// Updates are delta-encoded against the last confirmed remote state
    /// when the entity allows it and nothing else is queued for the record.
    /// An update that changes nothing relative to that state is dropped and
    /// `None` returned.
    pub fn enqueue_mutation(
        &self,
        collection: &str,
        record_id: &str,
        kind: OperationKind,
        payload: Option<Payload>,
    ) -> SyncResult<Option<ItemId>> {
        self.ensure_accepting()?;
        let entity = self.entity_config(collection)?;

        let body = match kind {
            OperationKind::Delete => OperationPayload::Empty,
            OperationKind::Create => OperationPayload::Full(
                payload.ok_or_else(|| SyncError::Validation("create requires a payload".into()))?,
            ),
            OperationKind::Update => {
                let payload =
                    payload.ok_or_else(|| SyncError::Validation("update requires a payload".into()))?;
                let pending = self.inner.queue.has_pending(collection, record_id);
                match self.inner.replica.last_synced(collection, record_id)? {
                    Some(snapshot) if !pending => {
                        let patch = calculate_delta(&snapshot.payload, &payload);
                        if patch.is_empty() {
                            tracing::debug!(collection, record_id, "update matches confirmed state, skipped");
                            return Ok(None);
                        }
                        if entity.delta_updates {
                            OperationPayload::Delta(patch)
                        } else {
                            OperationPayload::Full(payload)
                        }
                    }
                    _ => OperationPayload::Full(payload),
                }
            }
        };

        let item = QueueItem::new(collection, record_id, kind, body).with_priority(entity.priority);
        let id = self.push(item)?;
        self.inner.scheduler.notify_data_change(collection, Utc::now())?;
        Ok(Some(id))
    }

    /// Enqueues whatever a dirty replica record needs.
    ///
    /// The kind is inferred: deleted records become deletes, records the
    /// backend has never confirmed become creates and the rest updates. A
    /// record created and deleted before its create was sent is removed
    /// locally without touching the backend.
    pub fn enqueue_record(&self, collection: &str, record_id: &str) -> SyncResult<Option<ItemId>> {
        self.ensure_accepting()?;
        let record = self
            .inner
            .replica
            .read(collection, record_id)?
            .ok_or_else(|| SyncError::Validation(format!("{collection}/{record_id} is not in the replica")))?;
        if !record.dirty {
            return Ok(None);
        }

        let synced = self.inner.replica.last_synced(collection, record_id)?.is_some();
        let pending = self.inner.queue.has_pending(collection, record_id);

        if record.deleted {
            if !synced && !pending {
                self.inner.replica.remove(collection, record_id)?;
                tracing::debug!(collection, record_id, "unsent record deleted locally");
                return Ok(None);
            }
            return self.enqueue_mutation(collection, record_id, OperationKind::Delete, None);
        }

        let kind = if synced || pending {
            OperationKind::Update
        } else {
            OperationKind::Create
        };
        self.enqueue_mutation(collection, record_id, kind, Some(record.fields))
    }

    /// Enqueues every dirty record of `collection` that has nothing queued.
    /// Returns the number of items enqueued.
    pub fn sync_dirty(&self, collection: &str) -> SyncResult<usize> {
        self.ensure_accepting()?;
        self.entity_config(collection)?;

        let mut enqueued = 0;
        for record in self.inner.replica.list_dirty(collection)? {
            if self.inner.queue.has_pending(collection, &record.id) {
                continue;
            }
            if self.enqueue_record(collection, &record.id)?.is_some() {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            tracing::debug!(collection, enqueued, "dirty records enqueued");
        }
        Ok(enqueued)
    }

    fn push(&self, item: QueueItem) -> SyncResult<ItemId> {
        let outcome = self.inner.queue.enqueue(item)?;
        if let Some(evicted) = outcome.evicted {
            let reason = evicted.last_error.clone().unwrap_or_else(|| "evicted".into());
            self.bump(|c| c.dead_lettered += 1);
            self.emit(SyncEvent::DeadLettered {
                item_id: evicted.id,
                collection: evicted.collection,
                record_id: evicted.record_id,
                reason,
            });
            self.emit_queue_change(QueueChange::Evicted);
        }
        Ok(outcome.id)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatches queued work until nothing more is admissible.
    ///
    /// Items waiting out a retry backoff, and items blocked behind them,
    /// are left queued.
    pub async fn process_pending(&self) -> SyncResult<ProcessReport> {
        self.ensure_accepting()?;
        let mut report = ProcessReport::default();
        loop {
            let admitted = self.admit_all();
            if admitted.is_empty() {
                break;
            }
            for outcome in self.run_admitted(admitted).await {
                tally(&mut report, outcome);
            }
        }
        Ok(report)
    }

    fn admit_all(&self) -> Vec<QueueItem> {
        let mut admitted = Vec::new();
        while let Some(item) = self.inner.queue.dequeue(Instant::now()) {
            admitted.push(item);
        }
        admitted
    }

    /// Splits admitted items into individually dispatched items and
    /// per-collection batches.
    fn group_admitted(&self, items: Vec<QueueItem>) -> (Vec<QueueItem>, BTreeMap<String, Vec<QueueItem>>) {
        let mut singles = Vec::new();
        let mut groups: BTreeMap<String, Vec<QueueItem>> = BTreeMap::new();
        for item in items {
            if self.batch_eligible(&item.collection) {
                groups.entry(item.collection.clone()).or_default().push(item);
            } else {
                singles.push(item);
            }
        }
        (singles, groups)
    }

    async fn run_admitted(&self, items: Vec<QueueItem>) -> Vec<ItemOutcome> {
        let (singles, groups) = self.group_admitted(items);
        let mut outcomes = Vec::new();
        for item in singles {
            outcomes.push(self.dispatch(item).await);
        }
        for (collection, items) in groups {
            outcomes.extend(self.dispatch_batch(&collection, items).await);
        }
        outcomes
    }

    fn spawn_admitted(&self, items: Vec<QueueItem>) {
        let (singles, groups) = self.group_admitted(items);
        for item in singles {
            let this = self.clone();
            tokio::spawn(async move {
                this.dispatch(item).await;
            });
        }
        for (collection, items) in groups {
            let this = self.clone();
            tokio::spawn(async move {
                this.dispatch_batch(&collection, items).await;
            });
        }
    }

    async fn dispatch_batch(&self, collection: &str, items: Vec<QueueItem>) -> Vec<ItemOutcome> {
        let report = self.inner.batch.execute(items, |item| self.dispatch(item)).await;
        tracing::debug!(
            collection,
            strategy = ?report.strategy,
            items = report.results.len(),
            failures = report.failures,
            "batch dispatched"
        );
        report.results
    }

    async fn dispatch(&self, item: QueueItem) -> ItemOutcome {
        let started = Instant::now();
        self.emit(SyncEvent::OperationStarted {
            item_id: item.id,
            collection: item.collection.clone(),
            record_id: item.record_id.clone(),
            kind: item.kind,
            attempt: item.attempts,
        });

        let outcome = match self.send(&item).await {
            Ok(sent) => self.on_success(&item, sent),
            Err(Failure::Adapter(err)) if err.is_conflict() => self.on_conflict(&item, err.remote).await,
            Err(Failure::Adapter(err)) if err.is_transient() => self.on_transient(&item, err.to_string()),
            Err(Failure::Adapter(err)) => self.on_permanent(&item, err.to_string()),
            Err(Failure::Invalid(reason)) => self.on_permanent(&item, reason),
            Err(Failure::Replica(reason)) => self.on_transient(&item, reason),
        };
        self.feed_scheduler(&item.collection, outcome, started.elapsed());
        outcome
    }

    async fn send(&self, item: &QueueItem) -> Result<Sent, Failure> {
        let adapter = &self.inner.adapter;
        let (collection, id) = (item.collection.as_str(), item.record_id.as_str());
        let snapshot = self
            .inner
            .replica
            .last_synced(collection, id)
            .map_err(|err| Failure::Replica(err.to_string()))?;
        let expected = snapshot.as_ref().map(|s| s.remote_version);

        match (item.kind, &item.payload) {
            (OperationKind::Delete, _) => {
                adapter.delete(collection, id, expected).await?;
                Ok(Sent::Deleted)
            }
            (OperationKind::Create, OperationPayload::Full(payload)) => {
                let remote = adapter.create(collection, id, payload).await?;
                Ok(Sent::Written {
                    sent: payload.clone(),
                    remote,
                })
            }
            (OperationKind::Update, OperationPayload::Full(payload)) => {
                let remote = adapter.update(collection, id, payload, expected).await?;
                Ok(Sent::Written {
                    sent: payload.clone(),
                    remote,
                })
            }
            (OperationKind::Update, OperationPayload::Delta(patch)) => {
                let base = snapshot
                    .as_ref()
                    .ok_or_else(|| Failure::Invalid("delta update without a confirmed base".into()))?;
                let full = apply_delta(&base.payload, patch, true).map_err(|err| Failure::Invalid(err.to_string()))?;
                let remote = match adapter.patch(collection, id, patch, expected).await {
                    Err(err) if err.kind == AdapterErrorKind::Unsupported => {
                        adapter.update(collection, id, &full, expected).await?
                    }
                    other => other?,
                };
                Ok(Sent::Written { sent: full, remote })
            }
            (kind, _) => Err(Failure::Invalid(format!("{kind} operation has no usable payload"))),
        }
    }

    fn on_success(&self, item: &QueueItem, sent: Sent) -> ItemOutcome {
        let (collection, id) = (item.collection.as_str(), item.record_id.as_str());
        let replica_result = match &sent {
            Sent::Written { sent, remote } => {
                self.inner
                    .replica
                    .mark_synced(collection, id, sent, &remote.payload, remote.version, Utc::now())
            }
            Sent::Deleted => self.inner.replica.remove(collection, id),
        };
        if let Err(err) = replica_result {
            tracing::error!(item_id = %item.id, collection, record_id = id, error = %err, "replica update after sync failed");
        }
        if let Err(err) = self.inner.queue.complete(item.id) {
            tracing::warn!(item_id = %item.id, error = %err, "completing item failed");
        }

        let resolved = self.inner.resolutions.lock().remove(&item.id);
        if let Some((case, resolution)) = resolved {
            self.inner
                .registry
                .record_outcome(&case, &resolution, ResolutionOutcome::Succeeded);
        }

        self.bump(|c| c.completed += 1);
        self.emit(SyncEvent::OperationCompleted {
            item_id: item.id,
            collection: item.collection.clone(),
            record_id: item.record_id.clone(),
            success: true,
            error: None,
            retry_in_ms: None,
        });
        tracing::debug!(item_id = %item.id, collection, record_id = id, kind = %item.kind, "operation synced");
        ItemOutcome::Completed
    }

    fn on_transient(&self, item: &QueueItem, reason: String) -> ItemOutcome {
        match self.inner.queue.fail(item.id, reason.clone(), Instant::now()) {
            Ok(FailOutcome::RetryScheduled { attempts, delay }) => {
                self.bump(|c| c.retried += 1);
                self.emit(SyncEvent::OperationCompleted {
                    item_id: item.id,
                    collection: item.collection.clone(),
                    record_id: item.record_id.clone(),
                    success: false,
                    error: Some(reason.clone()),
                    retry_in_ms: Some(delay.as_millis() as u64),
                });
                tracing::info!(
                    item_id = %item.id,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %reason,
                    "operation failed, retry scheduled"
                );
                ItemOutcome::Retried
            }
            Ok(FailOutcome::DeadLettered(dead)) => self.after_dead_letter(&dead, reason),
            Err(err) => self.abandon(item, &err.to_string()),
        }
    }

    fn on_permanent(&self, item: &QueueItem, reason: String) -> ItemOutcome {
        match self.inner.queue.fail_permanent(item.id, reason.clone()) {
            Ok(dead) => self.after_dead_letter(&dead, reason),
            Err(err) => self.abandon(item, &err.to_string()),
        }
    }

    fn after_dead_letter(&self, item: &QueueItem, reason: String) -> ItemOutcome {
        let failed = self.inner.resolutions.lock().remove(&item.id);
        if let Some((case, resolution)) = failed {
            self.inner
                .registry
                .record_outcome(&case, &resolution, ResolutionOutcome::Failed);
        }

        self.bump(|c| c.dead_lettered += 1);
        self.emit(SyncEvent::OperationCompleted {
            item_id: item.id,
            collection: item.collection.clone(),
            record_id: item.record_id.clone(),
            success: false,
            error: Some(reason.clone()),
            retry_in_ms: None,
        });
        tracing::warn!(
            item_id = %item.id,
            collection = %item.collection,
            record_id = %item.record_id,
            attempts = item.attempts,
            error = %reason,
            "operation dead-lettered"
        );
        self.emit(SyncEvent::DeadLettered {
            item_id: item.id,
            collection: item.collection.clone(),
            record_id: item.record_id.clone(),
            reason,
        });
        ItemOutcome::DeadLettered
    }

    fn abandon(&self, item: &QueueItem, error: &str) -> ItemOutcome {
        tracing::error!(item_id = %item.id, error, "queue rejected item transition");
        ItemOutcome::Abandoned
    }

    async fn on_conflict(&self, item: &QueueItem, remote: Option<RemoteRecord>) -> ItemOutcome {
        let (collection, id) = (item.collection.as_str(), item.record_id.as_str());

        let failed = self.inner.resolutions.lock().remove(&item.id);
        if let Some((case, resolution)) = failed {
            self.inner
                .registry
                .record_outcome(&case, &resolution, ResolutionOutcome::Failed);
        }

        let remote = match remote {
            Some(remote) => remote,
            None => match self.inner.adapter.read(collection, id).await {
                Ok(remote) => remote,
                Err(err) if err.is_transient() => return self.on_transient(item, err.to_string()),
                Err(err) => return self.on_permanent(item, format!("conflicting record unreadable: {err}")),
            },
        };

        let base = match self.inner.replica.last_synced(collection, id) {
            Ok(snapshot) => snapshot.map(|s| s.payload),
            Err(err) => return self.on_transient(item, err.to_string()),
        };
        let local = match &item.payload {
            OperationPayload::Full(payload) => payload.clone(),
            OperationPayload::Delta(patch) => match &base {
                Some(base) => apply_delta(base, patch, false).unwrap_or_else(|_| base.clone()),
                None => patch.changes.clone(),
            },
            OperationPayload::Empty => Payload::new(),
        };

        let case = ConflictCase::new(collection, id, base, local.clone(), remote.payload.clone());
        self.bump(|c| c.conflicts_detected += 1);
        self.emit(SyncEvent::ConflictDetected {
            case_id: case.id,
            item_id: Some(item.id),
            collection: item.collection.clone(),
            record_id: item.record_id.clone(),
            fields: case.fields.len(),
        });
        tracing::info!(item_id = %item.id, collection, record_id = id, fields = case.fields.len(), "version conflict");

        // Rebase on the remote state so the next attempt carries its version.
        let snapshot = SyncedSnapshot {
            payload: remote.payload.clone(),
            remote_version: remote.version,
            synced_at: Utc::now(),
        };
        if let Err(err) = self.inner.replica.record_remote(collection, id, snapshot) {
            tracing::warn!(collection, record_id = id, error = %err, "recording remote state failed");
        }

        if item.kind == OperationKind::Delete {
            return self.park(item, case, None, remote.version, "remote changed before delete");
        }

        let resolution = self.inner.registry.resolve(&case);
        if !resolution.is_auto_resolved() {
            return self.park(
                item,
                case,
                Some(resolution),
                remote.version,
                "resolution needs an operator",
            );
        }

        self.bump(|c| c.conflicts_auto_resolved += 1);
        self.emit_resolved(&resolution);

        if resolution.merged == remote.payload {
            if self.local_unchanged(collection, id, &local) {
                if let Err(err) =
                    self.inner
                        .replica
                        .apply_remote(collection, id, remote.payload.clone(), remote.version, Utc::now())
                {
                    tracing::warn!(collection, record_id = id, error = %err, "adopting remote state failed");
                }
            }
            if let Err(err) = self.inner.queue.complete(item.id) {
                return self.abandon(item, &err.to_string());
            }
            self.inner
                .registry
                .record_outcome(&case, &resolution, ResolutionOutcome::Succeeded);
            self.bump(|c| c.completed += 1);
            self.emit(SyncEvent::OperationCompleted {
                item_id: item.id,
                collection: item.collection.clone(),
                record_id: item.record_id.clone(),
                success: true,
                error: None,
                retry_in_ms: None,
            });
            return ItemOutcome::Completed;
        }

        if self.local_unchanged(collection, id, &local) {
            self.write_local(collection, id, resolution.merged.clone());
        }

        let requeued = self.inner.queue.requeue_resolved(
            item.id,
            OperationKind::Update,
            OperationPayload::Full(resolution.merged.clone()),
        );
        match requeued {
            Ok(true) => {
                tracing::debug!(item_id = %item.id, resolver = %resolution.resolver, "merged payload requeued");
                self.inner.resolutions.lock().insert(item.id, (case, resolution));
                ItemOutcome::Requeued
            }
            Ok(false) => {
                self.inner
                    .registry
                    .record_outcome(&case, &resolution, ResolutionOutcome::Failed);
                self.record_parked(item.id, case, Some(resolution), remote.version);
                ItemOutcome::Parked
            }
            Err(err) => self.abandon(item, &err.to_string()),
        }
    }

    fn park(
        &self,
        item: &QueueItem,
        case: ConflictCase,
        resolution: Option<EnhancedResolution>,
        remote_version: u64,
        reason: &str,
    ) -> ItemOutcome {
        if let Err(err) = self.inner.queue.park(item.id, reason) {
            return self.abandon(item, &err.to_string());
        }
        self.record_parked(item.id, case, resolution, remote_version);
        ItemOutcome::Parked
    }

    fn record_parked(
        &self,
        item_id: ItemId,
        case: ConflictCase,
        resolution: Option<EnhancedResolution>,
        remote_version: u64,
    ) {
        tracing::info!(
            item_id = %item_id,
            collection = %case.collection,
            record_id = %case.record_id,
            "conflict parked for an operator"
        );
        self.bump(|c| c.conflicts_parked += 1);
        self.emit(SyncEvent::ConflictParked {
            case_id: case.id,
            item_id,
            collection: case.collection.clone(),
            record_id: case.record_id.clone(),
        });
        self.inner.parked.lock().insert(
            item_id,
            ParkedConflict {
                item_id,
                case,
                resolution,
                remote_version,
            },
        );
    }

    fn local_unchanged(&self, collection: &str, id: &str, local: &Payload) -> bool {
        matches!(
            self.inner.replica.read(collection, id),
            Ok(Some(record)) if record.fields == *local
        )
    }

    fn write_local(&self, collection: &str, id: &str, fields: Payload) {
        let written = self.inner.replica.read(collection, id).and_then(|record| match record {
            Some(mut record) => {
                record.apply_local_edit(fields);
                self.inner.replica.write(collection, record)
            }
            None => Ok(()),
        });
        if let Err(err) = written {
            tracing::warn!(collection, record_id = id, error = %err, "writing merged record failed");
        }
    }

    fn feed_scheduler(&self, collection: &str, outcome: ItemOutcome, elapsed: Duration) {
        let result = match outcome {
            ItemOutcome::Completed | ItemOutcome::Requeued => SyncOutcome::success(elapsed),
            ItemOutcome::Retried | ItemOutcome::DeadLettered => SyncOutcome::failure(elapsed),
            ItemOutcome::Parked | ItemOutcome::Abandoned => return,
        };
        if let Err(err) = self
            .inner
            .scheduler
            .record_sync_result(collection, result, Utc::now())
        {
            tracing::debug!(collection, error = %err, "sync result not recorded");
        }
    }

    // =========================================================================
    // Parked conflicts
    // =========================================================================

    /// Conflicts waiting for an operator.
    pub fn parked_conflicts(&self) -> Vec<ParkedConflict> {
        let mut parked: Vec<ParkedConflict> = self.inner.parked.lock().values().cloned().collect();
        parked.sort_by_key(|p| p.case.detected_at);
        parked
    }

    /// Applies an operator decision to a parked conflict.
    ///
    /// `KeepRemote` dead-letters the parked item and adopts the remote
    /// state locally; the other decisions queue a new attempt.
    pub fn resolve_parked(&self, item_id: ItemId, resolution: ManualResolution) -> SyncResult<()> {
        let parked = self
            .inner
            .parked
            .lock()
            .remove(&item_id)
            .ok_or_else(|| SyncError::Validation(format!("no parked conflict for item {item_id}")))?;

        let queued = match &resolution {
            ManualResolution::UsePayload(payload) => self.inner.queue.resume_parked(
                item_id,
                OperationKind::Update,
                OperationPayload::Full(payload.clone()),
            ),
            ManualResolution::KeepRemote => self.inner.queue.discard_parked(item_id).map(|_| ()),
            ManualResolution::Delete => {
                self.inner
                    .queue
                    .resume_parked(item_id, OperationKind::Delete, OperationPayload::Empty)
            }
        };
        if let Err(err) = queued {
            self.inner.parked.lock().insert(item_id, parked);
            return Err(err.into());
        }

        let case = &parked.case;
        let action = match &resolution {
            ManualResolution::UsePayload(_) => ResolutionAction::Merged,
            ManualResolution::KeepRemote => ResolutionAction::UseRemote,
            ManualResolution::Delete => ResolutionAction::UseLocal,
        };
        self.emit(SyncEvent::ConflictResolved {
            case_id: case.id,
            collection: case.collection.clone(),
            record_id: case.record_id.clone(),
            resolver: OPERATOR.into(),
            action,
            confidence: 1.0,
        });
        tracing::info!(item_id = %item_id, ?action, "parked conflict resolved by operator");

        match resolution {
            ManualResolution::UsePayload(payload) => {
                if let Some(mut record) = self.inner.replica.read(&case.collection, &case.record_id)? {
                    record.apply_local_edit(payload);
                    self.inner.replica.write(&case.collection, record)?;
                }
            }
            ManualResolution::KeepRemote => self.inner.replica.apply_remote(
                &case.collection,
                &case.record_id,
                case.remote.clone(),
                parked.remote_version,
                Utc::now(),
            )?,
            ManualResolution::Delete => {}
        }
        Ok(())
    }

    // =========================================================================
    // Remote changes
    // =========================================================================

    /// Pulls the remote state of a collection into the replica.
    ///
    /// Records with queued operations are skipped; the push path resolves
    /// them. Records with unpushed local edits are merged with the
    /// registered resolver and stay dirty when the merge differs from the
    /// remote state.
    pub async fn pull_collection(&self, collection: &str) -> SyncResult<PullReport> {
        self.ensure_accepting()?;
        self.entity_config(collection)?;
        let started = Instant::now();

        let remote = match self.inner.adapter.query(collection, &Query::all()).await {
            Ok(records) => records,
            Err(err) => {
                if err.is_transient() {
                    self.record_pull_result(collection, false, started.elapsed());
                }
                return Err(err.into());
            }
        };

        let mut locals: HashMap<RecordId, Record> = HashMap::new();
        let mut confirmed: Vec<(RecordId, Payload)> = Vec::new();
        for record in self.inner.replica.list(collection)? {
            if let Some(snapshot) = self.inner.replica.last_synced(collection, &record.id)? {
                confirmed.push((record.id.clone(), snapshot.payload));
            }
            locals.insert(record.id.clone(), record);
        }
        let remote_pairs: Vec<(RecordId, Payload)> =
            remote.iter().map(|r| (r.id.clone(), r.payload.clone())).collect();
        let remote_by_id: HashMap<&str, &RemoteRecord> = remote.iter().map(|r| (r.id.as_str(), r)).collect();

        let delta = calculate_collection_delta(&confirmed, &remote_pairs);
        let mut report = PullReport::default();

        let changed = delta
            .created
            .iter()
            .map(|(id, _)| id)
            .chain(delta.updated.iter().map(|(id, _)| id));
        for id in changed {
            if let Some(record) = remote_by_id.get(id.as_str()) {
                self.merge_remote(collection, record, locals.get(id), &mut report)?;
            }
        }

        for id in &delta.deleted {
            if self.inner.queue.has_pending(collection, id) {
                report.skipped += 1;
                continue;
            }
            match locals.get(id) {
                Some(record) if record.dirty => report.unresolved += 1,
                _ => {
                    self.inner.replica.remove(collection, id)?;
                    report.removed += 1;
                }
            }
        }

        self.bump(|c| c.pulled += report.applied as u64);
        self.record_pull_result(collection, true, started.elapsed());
        self.emit(SyncEvent::PullCompleted {
            collection: collection.to_string(),
            applied: report.applied,
            removed: report.removed,
            resolved: report.resolved,
            unresolved: report.unresolved,
        });
        tracing::info!(
            collection,
            applied = report.applied,
            removed = report.removed,
            resolved = report.resolved,
            unresolved = report.unresolved,
            skipped = report.skipped,
            "pull completed"
        );
        Ok(report)
    }

    fn merge_remote(
        &self,
        collection: &str,
        remote: &RemoteRecord,
        local: Option<&Record>,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        let id = remote.id.as_str();
        if self.inner.queue.has_pending(collection, id) {
            report.skipped += 1;
            return Ok(());
        }

        let record = match local {
            Some(record) if record.deleted => {
                report.unresolved += 1;
                return Ok(());
            }
            Some(record) if record.dirty => record,
            _ => {
                self.inner
                    .replica
                    .apply_remote(collection, id, remote.payload.clone(), remote.version, Utc::now())?;
                report.applied += 1;
                return Ok(());
            }
        };

        let base = self.inner.replica.last_synced(collection, id)?.map(|s| s.payload);
        let case = ConflictCase::new(collection, id, base, record.fields.clone(), remote.payload.clone());
        if case.is_identical() {
            self.inner
                .replica
                .apply_remote(collection, id, remote.payload.clone(), remote.version, Utc::now())?;
            report.applied += 1;
            return Ok(());
        }

        self.bump(|c| c.conflicts_detected += 1);
        self.emit(SyncEvent::ConflictDetected {
            case_id: case.id,
            item_id: None,
            collection: collection.to_string(),
            record_id: record.id.clone(),
            fields: case.fields.len(),
        });

        let resolution = self.inner.registry.resolve(&case);
        if !resolution.is_auto_resolved() {
            report.unresolved += 1;
            return Ok(());
        }
        self.bump(|c| c.conflicts_auto_resolved += 1);
        self.emit_resolved(&resolution);

        if resolution.merged == remote.payload {
            self.inner
                .replica
                .apply_remote(collection, id, remote.payload.clone(), remote.version, Utc::now())?;
            report.applied += 1;
        } else {
            self.inner.replica.record_remote(
                collection,
                id,
                SyncedSnapshot {
                    payload: remote.payload.clone(),
                    remote_version: remote.version,
                    synced_at: Utc::now(),
                },
            )?;
            let mut merged = record.clone();
            merged.apply_local_edit(resolution.merged);
            self.inner.replica.write(collection, merged)?;
        }
        report.resolved += 1;
        Ok(())
    }

    fn record_pull_result(&self, collection: &str, success: bool, elapsed: Duration) {
        let outcome = if success {
            SyncOutcome::success(elapsed)
        } else {
            SyncOutcome::failure(elapsed)
        };
        if let Err(err) = self
            .inner
            .scheduler
            .record_sync_result(collection, outcome, Utc::now())
        {
            tracing::debug!(collection, error = %err, "pull result not recorded");
        }
    }

    /// Subscribes to remote changes of a collection.
    ///
    /// Each change is reported as [`SyncEvent::RemoteChanged`] and nudges the
    /// scheduler. The subscription ends on [`stop`](Self::stop).
    pub async fn watch_remote(&self, collection: &str) -> SyncResult<SubscriptionId> {
        self.ensure_accepting()?;
        self.entity_config(collection)?;

        let subscription = self
            .inner
            .adapter
            .subscribe(collection, &SubscribeOptions::default())
            .await?;
        let id = subscription.id;
        self.inner.subscriptions.lock().push(id);

        let this = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(this.forward_remote(subscription, shutdown));
        self.inner.workers.lock().push(handle);
        tracing::info!(collection, subscription = %id, "watching remote changes");
        Ok(id)
    }

    async fn forward_remote(self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                change = subscription.changes.recv() => {
                    let Some(change) = change else { break };
                    if let Err(err) = self.inner.scheduler.notify_data_change(&change.collection, Utc::now()) {
                        tracing::debug!(collection = %change.collection, error = %err, "change notification dropped");
                    }
                    self.emit(SyncEvent::RemoteChanged {
                        collection: change.collection,
                        record_id: change.record_id,
                        kind: change.kind,
                    });
                }
            }
        }
        tracing::debug!(subscription = %subscription.id, "remote watch ended");
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Handles every scheduler trigger due now. Returns how many fired.
    pub async fn run_due(&self) -> SyncResult<usize> {
        self.ensure_accepting()?;
        let triggers = self.inner.scheduler.poll_due(Utc::now());
        let fired = triggers.len();
        for trigger in triggers {
            self.on_trigger(trigger).await;
        }
        if let Some(change) = self.inner.queue.rebalance() {
            self.emit_queue_change(match change {
                RebalanceChange::Overloaded => QueueChange::Overloaded,
                RebalanceChange::Restored => QueueChange::Restored,
            });
        }
        Ok(fired)
    }

    async fn on_trigger(&self, trigger: ScheduleTrigger) {
        self.bump(|c| c.schedule_fired += 1);
        self.emit(SyncEvent::ScheduleFired {
            entity: trigger.entity.clone(),
            reason: trigger.reason,
            priority: trigger.priority,
        });
        tracing::debug!(entity = %trigger.entity, reason = ?trigger.reason, "schedule fired");

        let pull = self.entity(&trigger.entity).is_some_and(|e| e.pull_on_sync);
        if pull {
            if let Err(err) = self.pull_collection(&trigger.entity).await {
                tracing::warn!(entity = %trigger.entity, error = %err, "scheduled pull failed");
            }
        }
        if let Err(err) = self.sync_dirty(&trigger.entity) {
            tracing::warn!(entity = %trigger.entity, error = %err, "scheduled sync failed");
        }
    }

    /// Updates device conditions and recalculates intervals.
    pub fn update_conditions(&self, conditions: SystemConditions) {
        self.inner.scheduler.update_conditions(conditions, Utc::now());
    }

    /// Requests an immediate sync of `entity`.
    pub fn trigger_sync(&self, entity: &str) -> SyncResult<()> {
        self.inner.scheduler.trigger_now(entity)?;
        self.inner.queue.notifier().notify_one();
        Ok(())
    }

    // =========================================================================
    // Queue control
    // =========================================================================

    /// Stops admitting queued work. In-flight operations finish.
    pub fn pause(&self) {
        self.inner.queue.pause();
        self.emit_queue_change(QueueChange::Paused);
    }

    /// Resumes admissions.
    pub fn resume(&self) {
        self.inner.queue.resume();
        self.emit_queue_change(QueueChange::Resumed);
    }

    /// Dead-lettered operations.
    pub fn dead_letters(&self) -> Vec<QueueItem> {
        self.inner.queue.dead_letters()
    }

    /// Gives a dead-lettered operation a fresh start.
    pub fn requeue_dead_letter(&self, id: ItemId) -> SyncResult<ItemId> {
        self.ensure_accepting()?;
        Ok(self.inner.queue.requeue_dead_letter(id)?)
    }

    /// Snapshot of engine state.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state(),
            queue: self.inner.queue.stats(),
            counters: self.inner.counters.read().clone(),
            parked_conflicts: self.inner.parked.lock().len(),
            batch_error_rate: self.inner.batch.recent_error_rate(),
            entities: self.inner.entities.read().len(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connects the adapter. Returns false if the backend refused.
    pub async fn connect(&self) -> SyncResult<bool> {
        let connected = self.inner.adapter.connect(&self.inner.config.connection).await?;
        if connected {
            tracing::info!(adapter = self.inner.adapter.name(), "backend connected");
        } else {
            tracing::warn!(adapter = self.inner.adapter.name(), "backend refused connection");
        }
        Ok(connected)
    }

    /// Connects and spawns the worker loops on the current runtime.
    ///
    /// A refused or failed connection is logged, not returned: queued work
    /// retries until the backend is reachable.
    pub async fn start(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.write();
            let current = *state;
            match current {
                OrchestratorState::Idle => *state = OrchestratorState::Running,
                OrchestratorState::Running => {
                    return Err(SyncError::Validation("orchestrator already running".into()))
                }
                OrchestratorState::Stopping | OrchestratorState::Stopped => return Err(SyncError::Stopped),
            }
        }
        self.emit(SyncEvent::StateChanged {
            from: OrchestratorState::Idle,
            to: OrchestratorState::Running,
        });

        if let Err(err) = self.connect().await {
            tracing::warn!(error = %err, "backend connection failed");
        }

        let dispatch = tokio::spawn(self.clone().dispatch_loop(self.inner.shutdown.subscribe()));
        let scheduler = tokio::spawn(self.clone().scheduler_loop(self.inner.shutdown.subscribe()));
        self.inner.workers.lock().extend([dispatch, scheduler]);
        tracing::info!(entities = self.inner.entities.read().len(), "orchestrator started");
        Ok(())
    }

    /// Stops the worker loops, closes the queue and disconnects.
    ///
    /// Queued items stay queued. Enqueueing afterwards fails with
    /// [`SyncError::Stopped`].
    pub async fn stop(&self) {
        let from = {
            let mut state = self.inner.state.write();
            let from = *state;
            if matches!(from, OrchestratorState::Stopping | OrchestratorState::Stopped) {
                return;
            }
            *state = OrchestratorState::Stopping;
            from
        };
        self.emit(SyncEvent::StateChanged {
            from,
            to: OrchestratorState::Stopping,
        });

        self.inner.shutdown.send_replace(true);
        self.inner.queue.close();

        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
        for id in subscriptions {
            if let Err(err) = self.inner.adapter.unsubscribe(id).await {
                tracing::debug!(subscription = %id, error = %err, "unsubscribe failed");
            }
        }
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "worker task failed");
            }
        }
        if from.is_running() {
            if let Err(err) = self.inner.adapter.disconnect().await {
                tracing::debug!(error = %err, "disconnect failed");
            }
        }

        *self.inner.state.write() = OrchestratorState::Stopped;
        self.emit(SyncEvent::StateChanged {
            from: OrchestratorState::Stopping,
            to: OrchestratorState::Stopped,
        });
        tracing::info!(queued = self.inner.queue.len(), "orchestrator stopped");
    }

    async fn dispatch_loop(self, mut shutdown: watch::Receiver<bool>) {
        let notify = self.inner.queue.notifier();
        while !*shutdown.borrow() {
            let admitted = self.admit_all();
            if !admitted.is_empty() {
                self.spawn_admitted(admitted);
                continue;
            }
            let wait = self.idle_wait();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!("dispatch loop stopped");
    }

    fn idle_wait(&self) -> Duration {
        let idle = self.inner.config.idle_poll();
        self.inner
            .queue
            .next_retry_at()
            .map_or(idle, |at| at.saturating_duration_since(Instant::now()).min(idle))
    }

    async fn scheduler_loop(self, mut shutdown: watch::Receiver<bool>) {
        let tick = self.inner.config.tick();
        while !*shutdown.borrow() {
            if let Err(err) = self.run_due().await {
                tracing::debug!(error = %err, "scheduler pass skipped");
            }
            let now = Utc::now();
            let wait = self
                .inner
                .scheduler
                .next_wakeup(now)
                .map_or(tick, |at| (at - now).to_std().unwrap_or(Duration::ZERO).min(tick))
                .max(MIN_SCHEDULER_WAIT);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!("scheduler loop stopped");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn ensure_accepting(&self) -> SyncResult<()> {
        if self.state().accepts_work() {
            Ok(())
        } else {
            Err(SyncError::Stopped)
        }
    }

    fn entity_config(&self, name: &str) -> SyncResult<EntityConfig> {
        self.entity(name)
            .ok_or_else(|| SyncError::NotRegistered(name.to_string()))
    }

    fn batch_eligible(&self, collection: &str) -> bool {
        self.inner
            .entities
            .read()
            .get(collection)
            .is_some_and(|e| e.batch_eligible)
    }

    fn bump(&self, update: impl FnOnce(&mut SyncCounters)) {
        update(&mut self.inner.counters.write());
    }

    fn emit(&self, event: SyncEvent) {
        self.inner.events.emit(event);
    }

    fn emit_resolved(&self, resolution: &EnhancedResolution) {
        self.emit(SyncEvent::ConflictResolved {
            case_id: resolution.case_id,
            collection: resolution.collection.clone(),
            record_id: resolution.record_id.clone(),
            resolver: resolution.resolver.clone(),
            action: resolution.action,
            confidence: resolution.confidence,
        });
    }

    fn emit_queue_change(&self, change: QueueChange) {
        let stats = self.inner.queue.stats();
        self.emit(SyncEvent::QueueStatusChanged {
            change,
            queued: stats.total_queued(),
            in_flight: stats.total_in_flight(),
        });
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("adapter", &self.inner.adapter.name())
            .field("entities", &self.inner.entities.read().len())
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

fn tally(report: &mut ProcessReport, outcome: ItemOutcome) {
    match outcome {
        ItemOutcome::Completed => report.completed += 1,
        ItemOutcome::Requeued => report.requeued += 1,
        ItemOutcome::Parked => report.parked += 1,
        ItemOutcome::Retried => report.retried += 1,
        ItemOutcome::DeadLettered => report.dead_lettered += 1,
        ItemOutcome::Abandoned => {}
    }
}
