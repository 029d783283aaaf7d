//! The multi-tier priority queue.

use chrono::Utc;
use driftsync_core::RecordId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::item::{ItemId, ItemStatus, OperationKind, OperationPayload, Priority, QueueItem};
use crate::permit::{Permit, PermitPool};

/// Dead-letter reason for items evicted to make room.
pub const EVICTED_REASON: &str = "evicted";

/// Dead-letter reason for parked items discarded by an operator.
pub const DISCARDED_REASON: &str = "conflict discarded";

/// Result of a successful enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    /// ID of the new item.
    pub id: ItemId,
    /// Lower-priority item dead-lettered to make room, if any.
    pub evicted: Option<QueueItem>,
}

/// What happened to an item after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// A retry is scheduled.
    RetryScheduled {
        /// Failed attempts so far.
        attempts: u32,
        /// Backoff before the item is eligible again.
        delay: Duration,
    },
    /// Attempts are exhausted or the failure is permanent.
    DeadLettered(QueueItem),
}

/// Cap change applied by [`PriorityQueue::rebalance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceChange {
    /// High-priority caps widened and low-priority caps narrowed.
    Overloaded,
    /// Base caps restored.
    Restored,
}

/// Snapshot of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    /// Tier.
    pub priority: Priority,
    /// Items waiting for admission.
    pub queued: usize,
    /// Items waiting for backoff.
    pub retry_wait: usize,
    /// Items holding a permit.
    pub in_flight: usize,
    /// Current concurrency cap.
    pub max_concurrent: usize,
}

/// Snapshot of the whole queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Per-tier counts, highest priority first.
    pub tiers: Vec<TierStats>,
    /// Items parked for manual conflict resolution.
    pub parked: usize,
    /// Items in the dead-letter store.
    pub dead_letters: usize,
    /// Whether admissions are paused.
    pub paused: bool,
    /// Whether overload caps are in effect.
    pub overloaded: bool,
}

impl QueueStats {
    /// Items queued across all tiers.
    pub fn total_queued(&self) -> usize {
        self.tiers.iter().map(|t| t.queued).sum()
    }

    /// Items in flight across all tiers.
    pub fn total_in_flight(&self) -> usize {
        self.tiers.iter().map(|t| t.in_flight).sum()
    }

    /// Returns true if nothing is queued, waiting or in flight.
    pub fn is_idle(&self) -> bool {
        self.tiers
            .iter()
            .all(|t| t.queued == 0 && t.retry_wait == 0 && t.in_flight == 0)
    }
}

type RecordKey = (String, RecordId);

#[derive(Debug, Default)]
struct QueueState {
    /// Queued item IDs per tier, ordered by sequence.
    tiers: [VecDeque<(u64, ItemId)>; 4],
    /// Every non-terminal item.
    items: HashMap<ItemId, QueueItem>,
    /// Sequences of non-terminal items per record.
    record_heads: HashMap<RecordKey, BTreeSet<u64>>,
    in_flight: HashMap<ItemId, Permit>,
    dead_letters: VecDeque<QueueItem>,
    next_sequence: u64,
    paused: bool,
    closed: bool,
    overloaded_checks: u32,
    overloaded: bool,
}

impl QueueState {
    fn is_record_head(&self, item: &QueueItem) -> bool {
        self.record_heads
            .get(&item.record_key())
            .and_then(|sequences| sequences.first())
            == Some(&item.sequence)
    }

    fn insert_queued(&mut self, item: &QueueItem) {
        let tier = &mut self.tiers[item.priority.index()];
        let at = tier.partition_point(|(sequence, _)| *sequence < item.sequence);
        tier.insert(at, (item.sequence, item.id));
    }

    fn remove_queued(&mut self, item: &QueueItem) {
        let tier = &mut self.tiers[item.priority.index()];
        if let Some(at) = tier.iter().position(|(_, id)| *id == item.id) {
            tier.remove(at);
        }
    }

    fn forget_record(&mut self, item: &QueueItem) {
        let key = item.record_key();
        if let Some(sequences) = self.record_heads.get_mut(&key) {
            sequences.remove(&item.sequence);
            if sequences.is_empty() {
                self.record_heads.remove(&key);
            }
        }
    }

    fn count(&self, priority: Priority, status: ItemStatus) -> usize {
        self.items
            .values()
            .filter(|item| item.priority == priority && item.status == status)
            .count()
    }

    fn queued_total(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn take(&mut self, id: ItemId) -> QueueResult<QueueItem> {
        self.items.remove(&id).ok_or(QueueError::NotFound(id))
    }
}

/// Multi-tier priority queue with per-tier concurrency permits.
///
/// Dispatch is strictly by tier (critical first) and FIFO within a
/// tier. Successive operations on the same record are never reordered:
/// an item is only eligible once every earlier non-terminal item for
/// its record has finished.
///
/// Time is passed in explicitly so backoff can be tested without
/// sleeping.
pub struct PriorityQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    pools: [PermitPool; 4],
    notify: Arc<Notify>,
}

impl PriorityQueue {
    /// Creates an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        let notify = Arc::new(Notify::new());
        let pools = Priority::ALL
            .map(|priority| PermitPool::new(config.tier(priority).max_concurrent, Arc::clone(&notify)));
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            pools,
            notify,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Signalled on enqueue, resume and permit release.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Adds an item.
    ///
    /// Rejects with a capacity error if the target tier is full, or if the
    /// shared capacity is reached and no strictly lower-priority queued item
    /// can be evicted. An evicted item is dead-lettered and returned.
    pub fn enqueue(&self, mut item: QueueItem) -> QueueResult<EnqueueOutcome> {
        item.validate()?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }

        let tier = self.config.tier(item.priority);
        if state.tiers[item.priority.index()].len() >= tier.max_queued {
            tracing::debug!(tier = %item.priority, limit = tier.max_queued, "tier full");
            return Err(QueueError::TierFull {
                tier: item.priority,
                limit: tier.max_queued,
            });
        }

        let mut evicted = None;
        if state.items.len() >= self.config.total_capacity {
            let victim = Priority::ALL
                .iter()
                .rev()
                .filter(|p| item.priority.outranks(**p))
                .find_map(|p| state.tiers[p.index()].back().map(|(_, id)| *id));
            let Some(victim) = victim else {
                return Err(QueueError::QueueFull {
                    limit: self.config.total_capacity,
                });
            };
            let mut victim = state.take(victim)?;
            state.remove_queued(&victim);
            state.forget_record(&victim);
            victim.transition(ItemStatus::DeadLettered)?;
            victim.last_error = Some(EVICTED_REASON.to_string());
            tracing::warn!(
                item_id = %victim.id,
                tier = %victim.priority,
                collection = %victim.collection,
                record_id = %victim.record_id,
                "evicted queued item to make room"
            );
            self.push_dead_letter(&mut state, victim.clone());
            evicted = Some(victim);
        }

        item.status = ItemStatus::Queued;
        item.sequence = state.next_sequence;
        state.next_sequence += 1;
        item.enqueued_at = Utc::now();
        item.ready_at = None;

        let id = item.id;
        state.insert_queued(&item);
        state
            .record_heads
            .entry(item.record_key())
            .or_default()
            .insert(item.sequence);
        tracing::debug!(
            item_id = %id,
            tier = %item.priority,
            kind = %item.kind,
            collection = %item.collection,
            record_id = %item.record_id,
            "enqueued"
        );
        state.items.insert(id, item);
        drop(state);

        self.notify.notify_one();
        Ok(EnqueueOutcome { id, evicted })
    }

    /// Admits the next eligible item and returns it in flight.
    ///
    /// Retry-wait items whose backoff elapsed by `now` rejoin their tier
    /// first. Tiers are scanned from critical to low; a tier without a
    /// free permit is skipped. Returns `None` when paused or when nothing
    /// is eligible.
    pub fn dequeue(&self, now: Instant) -> Option<QueueItem> {
        let mut state = self.state.lock();
        self.promote_ready(&mut state, now);
        if state.paused {
            return None;
        }

        for priority in Priority::ALL {
            let pool = &self.pools[priority.index()];
            if pool.available() == 0 {
                continue;
            }

            let position = state.tiers[priority.index()].iter().position(|(_, id)| {
                state
                    .items
                    .get(id)
                    .is_some_and(|item| state.is_record_head(item))
            });
            let Some(position) = position else { continue };
            let Some(permit) = pool.try_acquire() else { continue };
            let Some((_, id)) = state.tiers[priority.index()].remove(position) else {
                continue;
            };
            let Some(item) = state.items.get_mut(&id) else { continue };

            if item.transition(ItemStatus::Admitted).is_err() || item.transition(ItemStatus::InFlight).is_err() {
                continue;
            }
            item.last_attempt_at = Some(Utc::now());
            let admitted = item.clone();
            state.in_flight.insert(id, permit);

            tracing::debug!(
                item_id = %id,
                tier = %priority,
                attempts = admitted.attempts,
                "admitted"
            );
            return Some(admitted);
        }
        None
    }

    /// Marks an in-flight item completed and removes it.
    pub fn complete(&self, id: ItemId) -> QueueResult<QueueItem> {
        let mut state = self.state.lock();
        let item = self.finish_in_flight(&mut state, id, ItemStatus::Completed)?;
        state.forget_record(&item);
        tracing::debug!(item_id = %id, "completed");
        Ok(item)
    }

    /// Records a failed attempt.
    ///
    /// Schedules a retry after the configured backoff while attempts
    /// remain, otherwise dead-letters the item.
    pub fn fail(&self, id: ItemId, reason: impl Into<String>, now: Instant) -> QueueResult<FailOutcome> {
        let reason = reason.into();
        let mut state = self.state.lock();
        let mut item = self.finish_in_flight(&mut state, id, ItemStatus::Failed)?;
        item.attempts += 1;
        item.last_error = Some(reason);

        if item.attempts < self.config.retry.max_attempts {
            let delay = self.config.retry.delay_for_attempt(item.attempts - 1);
            item.transition(ItemStatus::RetryWait)?;
            item.ready_at = Some(now + delay);
            let attempts = item.attempts;
            tracing::debug!(item_id = %id, attempts, delay_ms = delay.as_millis() as u64, "retry scheduled");
            state.items.insert(id, item);
            return Ok(FailOutcome::RetryScheduled { attempts, delay });
        }

        Ok(FailOutcome::DeadLettered(self.dead_letter(&mut state, item)?))
    }

    /// Dead-letters an in-flight item without retrying.
    pub fn fail_permanent(&self, id: ItemId, reason: impl Into<String>) -> QueueResult<QueueItem> {
        let mut state = self.state.lock();
        let mut item = self.finish_in_flight(&mut state, id, ItemStatus::Failed)?;
        item.attempts += 1;
        item.last_error = Some(reason.into());
        self.dead_letter(&mut state, item)
    }

    /// Re-queues an in-flight item that hit a conflict with a resolved body.
    ///
    /// The item keeps its place in FIFO order. Once the item has been
    /// resolved more than `max_conflict_requeues` times it is parked instead
    /// and `Ok(false)` is returned.
    pub fn requeue_resolved(
        &self,
        id: ItemId,
        kind: OperationKind,
        payload: OperationPayload,
    ) -> QueueResult<bool> {
        let mut state = self.state.lock();
        let mut item = self.finish_in_flight(&mut state, id, ItemStatus::Conflicted)?;
        item.conflicts += 1;
        item.kind = kind;
        item.payload = payload;

        if item.conflicts > self.config.max_conflict_requeues {
            item.transition(ItemStatus::Parked)?;
            item.last_error = Some(format!("unresolved after {} conflict resolutions", item.conflicts - 1));
            tracing::warn!(item_id = %id, conflicts = item.conflicts, "conflict loop, parking item");
            state.items.insert(id, item);
            return Ok(false);
        }

        item.transition(ItemStatus::Queued)?;
        state.insert_queued(&item);
        state.items.insert(id, item);
        drop(state);
        self.notify.notify_one();
        Ok(true)
    }

    /// Parks an in-flight item for manual conflict resolution.
    ///
    /// Parked items hold no permit and block later operations on the same
    /// record until resumed or discarded.
    pub fn park(&self, id: ItemId, reason: impl Into<String>) -> QueueResult<()> {
        let mut state = self.state.lock();
        let mut item = self.finish_in_flight(&mut state, id, ItemStatus::Conflicted)?;
        item.conflicts += 1;
        item.transition(ItemStatus::Parked)?;
        item.last_error = Some(reason.into());
        tracing::info!(item_id = %id, record_id = %item.record_id, "parked for manual resolution");
        state.items.insert(id, item);
        Ok(())
    }

    /// Parked items, oldest first.
    pub fn parked(&self) -> Vec<QueueItem> {
        let state = self.state.lock();
        let mut parked: Vec<QueueItem> = state
            .items
            .values()
            .filter(|item| item.status == ItemStatus::Parked)
            .cloned()
            .collect();
        parked.sort_by_key(|item| item.sequence);
        parked
    }

    /// Resumes a parked item with a manually resolved body.
    pub fn resume_parked(&self, id: ItemId, kind: OperationKind, payload: OperationPayload) -> QueueResult<()> {
        let mut state = self.state.lock();
        let mut item = state.take(id)?;
        if let Err(err) = item.transition(ItemStatus::Queued) {
            state.items.insert(id, item);
            return Err(err);
        }
        item.kind = kind;
        item.payload = payload;
        item.last_error = None;
        state.insert_queued(&item);
        state.items.insert(id, item);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Dead-letters a parked item.
    pub fn discard_parked(&self, id: ItemId) -> QueueResult<QueueItem> {
        let mut state = self.state.lock();
        let mut item = state.take(id)?;
        if item.status != ItemStatus::Parked {
            let err = QueueError::InvalidTransition {
                id,
                from: item.status,
                to: ItemStatus::DeadLettered,
            };
            state.items.insert(id, item);
            return Err(err);
        }
        item.last_error = Some(DISCARDED_REASON.to_string());
        self.dead_letter(&mut state, item)
    }

    /// Dead-lettered items, oldest first.
    pub fn dead_letters(&self) -> Vec<QueueItem> {
        self.state.lock().dead_letters.iter().cloned().collect()
    }

    /// Moves a dead-lettered item back into its tier as a fresh item.
    ///
    /// The revived item gets a new ID, sequence and a zero attempt count.
    /// Returns the new ID.
    pub fn requeue_dead_letter(&self, id: ItemId) -> QueueResult<ItemId> {
        let (at, dead) = {
            let mut state = self.state.lock();
            let at = state
                .dead_letters
                .iter()
                .position(|item| item.id == id)
                .ok_or(QueueError::NotFound(id))?;
            (at, state.dead_letters.remove(at).ok_or(QueueError::NotFound(id))?)
        };

        let mut revived = QueueItem::new(dead.collection.clone(), dead.record_id.clone(), dead.kind, dead.payload.clone())
            .with_priority(dead.priority);
        revived.last_error = dead.last_error.clone();

        match self.enqueue(revived) {
            Ok(outcome) => {
                tracing::info!(dead_id = %id, item_id = %outcome.id, "requeued dead letter");
                Ok(outcome.id)
            }
            Err(err) => {
                let mut state = self.state.lock();
                let at = at.min(state.dead_letters.len());
                state.dead_letters.insert(at, dead);
                while state.dead_letters.len() > self.config.dead_letter_capacity {
                    state.dead_letters.pop_front();
                }
                Err(err)
            }
        }
    }

    /// Drops every dead-lettered item. Returns how many were dropped.
    pub fn purge_dead_letters(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.dead_letters.len();
        state.dead_letters.clear();
        count
    }

    /// Stops new admissions. In-flight items are unaffected.
    pub fn pause(&self) {
        self.state.lock().paused = true;
        tracing::info!("queue paused");
    }

    /// Resumes admissions.
    pub fn resume(&self) {
        self.state.lock().paused = false;
        tracing::info!("queue resumed");
        self.notify.notify_one();
    }

    /// Returns true if admissions are paused.
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Discards every queued and retry-wait item.
    ///
    /// In-flight and parked items are kept. Returns the discarded items.
    pub fn clear(&self) -> Vec<QueueItem> {
        let mut state = self.state.lock();
        let ids: Vec<ItemId> = state
            .items
            .values()
            .filter(|item| matches!(item.status, ItemStatus::Queued | ItemStatus::RetryWait))
            .map(|item| item.id)
            .collect();

        let mut cleared = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = state.items.remove(&id) {
                state.forget_record(&item);
                cleared.push(item);
            }
        }
        for tier in state.tiers.iter_mut() {
            tier.clear();
        }
        cleared.sort_by_key(|item| item.sequence);
        tracing::info!(cleared = cleared.len(), "queue cleared");
        cleared
    }

    /// Rejects all further enqueues.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Adjusts tier caps under sustained backlog.
    ///
    /// Call periodically. After `sustain_checks` consecutive checks with
    /// more than `backlog_threshold` queued items, critical and high caps
    /// widen and normal and low caps narrow. Base caps return once the
    /// backlog drains below the threshold.
    pub fn rebalance(&self) -> Option<RebalanceChange> {
        let overload = &self.config.overload;
        if !overload.enabled {
            return None;
        }

        let mut state = self.state.lock();
        let backlog = state.queued_total();
        if backlog > overload.backlog_threshold {
            state.overloaded_checks = state.overloaded_checks.saturating_add(1);
            if !state.overloaded && state.overloaded_checks >= overload.sustain_checks {
                state.overloaded = true;
                for priority in Priority::ALL {
                    let base = self.config.tier(priority).max_concurrent;
                    self.pools[priority.index()].set_cap(overload.overloaded_cap(priority, base));
                }
                tracing::warn!(backlog, "sustained overload, rebalancing tier caps");
                return Some(RebalanceChange::Overloaded);
            }
            return None;
        }

        state.overloaded_checks = 0;
        if state.overloaded {
            state.overloaded = false;
            for priority in Priority::ALL {
                self.pools[priority.index()].set_cap(self.config.tier(priority).max_concurrent);
            }
            tracing::info!(backlog, "backlog drained, restoring tier caps");
            return Some(RebalanceChange::Restored);
        }
        None
    }

    /// Returns true if a non-terminal item exists for the record.
    pub fn has_pending(&self, collection: &str, record_id: &str) -> bool {
        self.state
            .lock()
            .record_heads
            .contains_key(&(collection.to_string(), record_id.to_string()))
    }

    /// Looks up a non-terminal or dead-lettered item.
    pub fn get(&self, id: ItemId) -> Option<QueueItem> {
        let state = self.state.lock();
        state
            .items
            .get(&id)
            .cloned()
            .or_else(|| state.dead_letters.iter().find(|item| item.id == id).cloned())
    }

    /// Earliest time a retry-wait item becomes eligible.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.state
            .lock()
            .items
            .values()
            .filter(|item| item.status == ItemStatus::RetryWait)
            .filter_map(|item| item.ready_at)
            .min()
    }

    /// Number of non-terminal items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if no non-terminal items remain.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Snapshot of queue state.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let tiers = Priority::ALL
            .iter()
            .map(|priority| TierStats {
                priority: *priority,
                queued: state.tiers[priority.index()].len(),
                retry_wait: state.count(*priority, ItemStatus::RetryWait),
                in_flight: state.count(*priority, ItemStatus::InFlight),
                max_concurrent: self.pools[priority.index()].cap(),
            })
            .collect();
        QueueStats {
            tiers,
            parked: state
                .items
                .values()
                .filter(|item| item.status == ItemStatus::Parked)
                .count(),
            dead_letters: state.dead_letters.len(),
            paused: state.paused,
            overloaded: state.overloaded,
        }
    }

    fn promote_ready(&self, state: &mut QueueState, now: Instant) {
        let ready: Vec<ItemId> = state
            .items
            .values()
            .filter(|item| item.status == ItemStatus::RetryWait && item.ready_at.is_some_and(|at| at <= now))
            .map(|item| item.id)
            .collect();

        for id in ready {
            let Some(mut item) = state.items.remove(&id) else { continue };
            if item.transition(ItemStatus::Queued).is_ok() {
                item.ready_at = None;
                state.insert_queued(&item);
            }
            state.items.insert(id, item);
        }
    }

    /// Removes an in-flight item, releases its permit and moves it to `next`.
    fn finish_in_flight(&self, state: &mut QueueState, id: ItemId, next: ItemStatus) -> QueueResult<QueueItem> {
        let mut item = state.take(id)?;
        if item.status != ItemStatus::InFlight {
            let err = QueueError::InvalidTransition {
                id,
                from: item.status,
                to: next,
            };
            state.items.insert(id, item);
            return Err(err);
        }
        item.transition(next)?;
        state.in_flight.remove(&id);
        Ok(item)
    }

    fn dead_letter(&self, state: &mut QueueState, mut item: QueueItem) -> QueueResult<QueueItem> {
        item.transition(ItemStatus::DeadLettered)?;
        state.forget_record(&item);
        tracing::warn!(
            item_id = %item.id,
            collection = %item.collection,
            record_id = %item.record_id,
            attempts = item.attempts,
            reason = item.last_error.as_deref().unwrap_or_default(),
            "dead-lettered"
        );
        self.push_dead_letter(state, item.clone());
        Ok(item)
    }

    fn push_dead_letter(&self, state: &mut QueueState, item: QueueItem) {
        if self.config.dead_letter_capacity == 0 {
            return;
        }
        while state.dead_letters.len() >= self.config.dead_letter_capacity {
            state.dead_letters.pop_front();
        }
        state.dead_letters.push_back(item);
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl std::fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("stats", &self.stats())
            .finish()
    }
}
