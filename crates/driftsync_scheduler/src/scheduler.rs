//! The adaptive scheduler.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use driftsync_queue::Priority;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::conditions::SystemConditions;
use crate::config::{IntervalBounds, SchedulerConfig};
use crate::error::{SchedulerError, SchedulerResult};
use crate::interval::{compute_interval, IntervalSignals};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::strategy::{next_time_of_day, ScheduleStrategy};

/// Scheduling options for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitySchedule {
    /// Priority, selecting the default interval bounds.
    pub priority: Priority,
    /// Bounds overriding the priority defaults.
    pub bounds: Option<IntervalBounds>,
    /// Strategy overriding the global strategy.
    pub strategy: Option<ScheduleStrategy>,
}

impl EntitySchedule {
    /// Options for `priority` with default bounds and the global strategy.
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Overrides the interval bounds.
    pub fn with_bounds(mut self, bounds: IntervalBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Overrides the strategy.
    pub fn with_strategy(mut self, strategy: ScheduleStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Why a trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// Regular cadence or wall-clock time.
    Scheduled,
    /// Early retry after a failed sync.
    Retry,
    /// Debounced data change.
    DataChange,
    /// Explicit "sync now" request.
    Manual,
}

/// A request to sync one entity now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    /// Entity name.
    pub entity: String,
    /// Entity priority.
    pub priority: Priority,
    /// Why it fired.
    pub reason: TriggerReason,
    /// When it fired.
    pub fired_at: DateTime<Utc>,
}

/// Outcome of one sync, fed back into the metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Whether the sync succeeded.
    pub success: bool,
    /// How long it took.
    pub duration: Duration,
}

impl SyncOutcome {
    /// A successful sync.
    pub fn success(duration: Duration) -> Self {
        Self {
            success: true,
            duration,
        }
    }

    /// A failed sync.
    pub fn failure(duration: Duration) -> Self {
        Self {
            success: false,
            duration,
        }
    }
}

/// Snapshot of an entity's schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Entity name.
    pub name: String,
    /// Priority.
    pub priority: Priority,
    /// Strategy in effect.
    pub strategy: ScheduleStrategy,
    /// Current interval, within the entity's bounds.
    pub interval_ms: u64,
    /// Bounds in effect.
    pub bounds: IntervalBounds,
    /// Next regular firing, if any.
    pub next_due: Option<DateTime<Utc>>,
    /// Pending early retry, if any.
    pub retry_due: Option<DateTime<Utc>>,
    /// Whether the entity is paused.
    pub paused: bool,
    /// Signals used for the last computation.
    pub signals: IntervalSignals,
    /// Rolling metrics.
    pub metrics: MetricsSnapshot,
}

impl ScheduleEntry {
    /// Current interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug)]
struct EntityState {
    priority: Priority,
    bounds: IntervalBounds,
    strategy: Option<ScheduleStrategy>,
    metrics: SyncMetrics,
    registered_at: DateTime<Utc>,
    interval: Duration,
    signals: IntervalSignals,
    computed_at: DateTime<Utc>,
    last_fired_at: Option<DateTime<Utc>>,
    next_due: Option<DateTime<Utc>>,
    retry_due: Option<DateTime<Utc>>,
    change_due: Option<DateTime<Utc>>,
    manual_pending: bool,
    paused: bool,
}

impl EntityState {
    fn anchor(&self) -> DateTime<Utc> {
        [self.last_fired_at, self.metrics.snapshot(self.computed_at).last_sync_at]
            .into_iter()
            .flatten()
            .fold(self.registered_at, |latest, at| latest.max(at))
    }
}

#[derive(Debug)]
struct SchedulerState {
    entries: HashMap<String, EntityState>,
    conditions: SystemConditions,
    global: ScheduleStrategy,
}

/// Computes per-entity sync cadence and emits triggers when entities
/// fall due.
///
/// The scheduler never sleeps; the caller polls it with the current time,
/// using [`next_wakeup`](Self::next_wakeup) to decide how long to wait.
#[derive(Debug)]
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    state: RwLock<SchedulerState>,
}

impl AdaptiveScheduler {
    /// Creates a scheduler using the adaptive strategy by default.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(SchedulerState {
                entries: HashMap::new(),
                conditions: SystemConditions::default(),
                global: ScheduleStrategy::Adaptive,
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Registers an entity and computes its first schedule.
    pub fn register(
        &self,
        name: impl Into<String>,
        schedule: EntitySchedule,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ScheduleEntry> {
        let name = name.into();
        let mut state = self.state.write();
        if state.entries.contains_key(&name) {
            return Err(SchedulerError::AlreadyRegistered(name));
        }

        let bounds = schedule
            .bounds
            .map(IntervalBounds::normalized)
            .unwrap_or_else(|| self.config.bounds(schedule.priority));
        let mut entity = EntityState {
            priority: schedule.priority,
            bounds,
            strategy: schedule.strategy,
            metrics: SyncMetrics::new(self.config.metrics_window, self.config.change_window_hours, now),
            registered_at: now,
            interval: bounds.base(),
            signals: IntervalSignals::default(),
            computed_at: now,
            last_fired_at: None,
            next_due: None,
            retry_due: None,
            change_due: None,
            manual_pending: false,
            paused: false,
        };
        let (global, conditions) = (state.global.clone(), state.conditions);
        self.recompute(&mut entity, &global, &conditions, now);
        tracing::debug!(
            entity = %name,
            priority = %entity.priority,
            interval_ms = entity.interval.as_millis() as u64,
            "registered schedule"
        );

        let entry = self.snapshot(&name, &entity, &global);
        state.entries.insert(name, entity);
        Ok(entry)
    }

    /// Removes an entity. Returns false if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.state.write().entries.remove(name).is_some()
    }

    /// Cancels pending triggers for an entity, keeping its metrics.
    pub fn pause_entity(&self, name: &str) -> SchedulerResult<()> {
        let mut state = self.state.write();
        let entity = state
            .entries
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotRegistered(name.to_string()))?;
        entity.paused = true;
        entity.next_due = None;
        entity.retry_due = None;
        entity.change_due = None;
        entity.manual_pending = false;
        tracing::debug!(entity = name, "schedule paused");
        Ok(())
    }

    /// Resumes a paused entity and recomputes its schedule.
    pub fn resume_entity(&self, name: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.with_entity(name, now, |entity| {
            entity.paused = false;
            // Restart the cadence from now rather than firing at once.
            entity.last_fired_at = Some(now);
        })
    }

    /// Feeds a sync outcome into the metrics.
    ///
    /// A failure schedules a retry-flavored trigger sooner than the regular
    /// cadence when the retry delay is shorter than the interval.
    pub fn record_sync_result(&self, name: &str, outcome: SyncOutcome, now: DateTime<Utc>) -> SchedulerResult<()> {
        let retry_delay = self.config.retry_delay();
        self.with_entity(name, now, |entity| {
            entity.metrics.record_outcome(outcome.success, outcome.duration, now);
            entity.retry_due = None;
            if !outcome.success {
                entity.last_fired_at = Some(now);
            }
        })?;

        let mut state = self.state.write();
        if let Some(entity) = state.entries.get_mut(name) {
            if !outcome.success && !entity.paused {
                let failures = entity.metrics.snapshot(now).consecutive_failures.max(1);
                let delay = retry_delay.saturating_mul(failures);
                if delay < entity.interval {
                    entity.retry_due = Some(after(now, delay));
                    tracing::debug!(entity = name, failures, delay_ms = delay.as_millis() as u64, "retry scheduled");
                }
            }
        }
        Ok(())
    }

    /// Records a local data change.
    ///
    /// Event-driven entities fire once no further change arrives within the
    /// debounce window. Other entities recalculate at most once per window.
    pub fn notify_data_change(&self, name: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        let debounce = self.config.debounce();
        let mut state = self.state.write();
        let (global, conditions) = (state.global.clone(), state.conditions);
        let entity = state
            .entries
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotRegistered(name.to_string()))?;
        entity.metrics.record_change(now);
        if entity.paused {
            return Ok(());
        }

        match entity.strategy.clone().unwrap_or(global.clone()) {
            ScheduleStrategy::EventDriven { debounce_ms } => {
                entity.change_due = Some(after(now, Duration::from_millis(debounce_ms)));
            }
            _ => {
                if now - entity.computed_at >= to_chrono(debounce) {
                    self.recompute(entity, &global, &conditions, now);
                }
            }
        }
        Ok(())
    }

    /// Replaces the system conditions and recomputes every schedule.
    pub fn update_conditions(&self, conditions: SystemConditions, now: DateTime<Utc>) {
        let mut state = self.state.write();
        if state.conditions == conditions {
            return;
        }
        state.conditions = conditions;
        tracing::info!(network = %conditions.network, power = %conditions.power, "conditions changed");
        let global = state.global.clone();
        for entity in state.entries.values_mut() {
            self.recompute(entity, &global, &conditions, now);
        }
    }

    /// Current system conditions.
    pub fn conditions(&self) -> SystemConditions {
        self.state.read().conditions
    }

    /// Changes the global strategy and recomputes every entity without an
    /// override.
    pub fn set_global_strategy(&self, strategy: ScheduleStrategy, now: DateTime<Utc>) {
        let mut state = self.state.write();
        tracing::info!(strategy = strategy.name(), "global strategy changed");
        state.global = strategy.clone();
        let conditions = state.conditions;
        for entity in state.entries.values_mut().filter(|e| e.strategy.is_none()) {
            entity.change_due = None;
            self.recompute(entity, &strategy, &conditions, now);
        }
    }

    /// Sets or clears an entity's strategy override.
    pub fn set_entity_strategy(
        &self,
        name: &str,
        strategy: Option<ScheduleStrategy>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        self.with_entity(name, now, |entity| {
            entity.strategy = strategy;
            entity.change_due = None;
        })
    }

    /// Recomputes one entity, or every entity when `name` is `None`.
    pub fn recalculate(&self, name: Option<&str>, now: DateTime<Utc>) -> SchedulerResult<()> {
        match name {
            Some(name) => self.with_entity(name, now, |_| {}),
            None => {
                let mut state = self.state.write();
                let (global, conditions) = (state.global.clone(), state.conditions);
                for entity in state.entries.values_mut() {
                    self.recompute(entity, &global, &conditions, now);
                }
                Ok(())
            }
        }
    }

    /// Requests an immediate sync of an entity, whatever its strategy.
    pub fn trigger_now(&self, name: &str) -> SchedulerResult<()> {
        let mut state = self.state.write();
        let entity = state
            .entries
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotRegistered(name.to_string()))?;
        if entity.paused {
            return Err(SchedulerError::Paused(name.to_string()));
        }
        entity.manual_pending = true;
        Ok(())
    }

    /// Returns triggers for every entity due at `now`, highest priority
    /// first, and advances their schedules.
    pub fn poll_due(&self, now: DateTime<Utc>) -> Vec<ScheduleTrigger> {
        let mut state = self.state.write();
        let (global, conditions) = (state.global.clone(), state.conditions);
        let mut triggers = Vec::new();

        for (name, entity) in state.entries.iter_mut() {
            if entity.paused {
                continue;
            }
            let due = |at: Option<DateTime<Utc>>| at.is_some_and(|at| at <= now);
            let reason = if entity.manual_pending {
                TriggerReason::Manual
            } else if due(entity.retry_due) {
                TriggerReason::Retry
            } else if due(entity.change_due) {
                TriggerReason::DataChange
            } else if due(entity.next_due) {
                TriggerReason::Scheduled
            } else {
                continue;
            };

            entity.manual_pending = false;
            entity.retry_due = None;
            entity.change_due = None;
            entity.last_fired_at = Some(now);
            self.recompute(entity, &global, &conditions, now);

            tracing::debug!(entity = %name, ?reason, "schedule fired");
            triggers.push(ScheduleTrigger {
                entity: name.clone(),
                priority: entity.priority,
                reason,
                fired_at: now,
            });
        }

        triggers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.entity.cmp(&b.entity)));
        triggers
    }

    /// Earliest time any entity falls due, or `now` if a manual trigger is
    /// pending. `None` when nothing is scheduled.
    pub fn next_wakeup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let state = self.state.read();
        state
            .entries
            .values()
            .filter(|entity| !entity.paused)
            .flat_map(|entity| {
                let manual = entity.manual_pending.then_some(now);
                [manual, entity.retry_due, entity.change_due, entity.next_due]
            })
            .flatten()
            .min()
    }

    /// Snapshot of one entity.
    pub fn entry(&self, name: &str) -> Option<ScheduleEntry> {
        let state = self.state.read();
        state
            .entries
            .get(name)
            .map(|entity| self.snapshot(name, entity, &state.global))
    }

    /// Snapshots of every entity, sorted by name.
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        let state = self.state.read();
        let mut entries: Vec<ScheduleEntry> = state
            .entries
            .iter()
            .map(|(name, entity)| self.snapshot(name, entity, &state.global))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Returns true if the entity is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.state.read().entries.contains_key(name)
    }

    fn with_entity(
        &self,
        name: &str,
        now: DateTime<Utc>,
        update: impl FnOnce(&mut EntityState),
    ) -> SchedulerResult<()> {
        let mut state = self.state.write();
        let (global, conditions) = (state.global.clone(), state.conditions);
        let entity = state
            .entries
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotRegistered(name.to_string()))?;
        update(entity);
        self.recompute(entity, &global, &conditions, now);
        Ok(())
    }

    fn recompute(
        &self,
        entity: &mut EntityState,
        global: &ScheduleStrategy,
        conditions: &SystemConditions,
        now: DateTime<Utc>,
    ) {
        let strategy = entity.strategy.as_ref().unwrap_or(global);
        let signals = entity
            .metrics
            .signals(now, self.config.reliability.min_samples);

        entity.interval = match strategy {
            ScheduleStrategy::Fixed { interval_ms } => {
                entity.bounds.clamp(Duration::from_millis(*interval_ms))
            }
            _ => compute_interval(&self.config, &entity.bounds, &signals, conditions),
        };
        entity.signals = signals;
        entity.computed_at = now;

        if entity.paused {
            entity.next_due = None;
            return;
        }

        entity.next_due = match strategy {
            ScheduleStrategy::Fixed { .. } | ScheduleStrategy::Adaptive => {
                Some(after(entity.anchor(), entity.interval))
            }
            ScheduleStrategy::TimeOfDay { times } => next_time_of_day(times, now),
            ScheduleStrategy::Manual | ScheduleStrategy::EventDriven { .. } => None,
        };
    }

    fn snapshot(&self, name: &str, entity: &EntityState, global: &ScheduleStrategy) -> ScheduleEntry {
        ScheduleEntry {
            name: name.to_string(),
            priority: entity.priority,
            strategy: entity.strategy.clone().unwrap_or_else(|| global.clone()),
            interval_ms: entity.interval.as_millis() as u64,
            bounds: entity.bounds,
            next_due: entity.next_due,
            retry_due: entity.retry_due,
            paused: entity.paused,
            signals: entity.signals,
            metrics: entity.metrics.snapshot(entity.computed_at),
        }
    }
}

impl Default for AdaptiveScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365_000))
}

fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
