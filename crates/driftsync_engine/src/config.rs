//! Configuration for the sync engine.

use driftsync_conflict::{ConflictStrategy, ResolverConfig};
use driftsync_queue::{Priority, QueueConfig};
use driftsync_scheduler::{EntitySchedule, IntervalBounds, ScheduleStrategy, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::adapter::ConnectionConfig;
use crate::batch::BatchConfig;

/// Configuration for the orchestrator and everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Queue tiers, retry and overload settings.
    pub queue: QueueConfig,
    /// Scheduler intervals and tuning.
    pub scheduler: SchedulerConfig,
    /// Conflict resolver tuning.
    pub resolver: ResolverConfig,
    /// Batch execution.
    pub batch: BatchConfig,
    /// Backend connection.
    pub connection: ConnectionConfig,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
    /// Longest the scheduler loop sleeps between checks, in milliseconds.
    pub tick_ms: u64,
    /// Longest the dispatch loop sleeps without a wakeup, in milliseconds.
    pub idle_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            resolver: ResolverConfig::default(),
            batch: BatchConfig::default(),
            connection: ConnectionConfig::default(),
            event_capacity: 1024,
            tick_ms: 1_000,
            idle_poll_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Sets the queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the scheduler configuration.
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the resolver configuration.
    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the batch configuration.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the backend connection.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Sets the scheduler tick.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_ms = tick.as_millis() as u64;
        self
    }

    /// Scheduler tick.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Dispatch loop idle poll.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

/// Sync settings for one entity (collection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Priority of the entity's operations and schedule.
    pub priority: Priority,
    /// Conflict resolver.
    pub conflict_strategy: ConflictStrategy,
    /// Whether operations may be grouped into batches.
    pub batch_eligible: bool,
    /// Whether updates are sent as deltas against the confirmed state.
    pub delta_updates: bool,
    /// Whether a scheduled sync pulls remote changes before pushing.
    pub pull_on_sync: bool,
    /// Interval bounds overriding the priority defaults.
    pub bounds: Option<IntervalBounds>,
    /// Schedule strategy overriding the global strategy.
    pub schedule: Option<ScheduleStrategy>,
    /// Fields whose conflicts lower merge confidence.
    pub critical_fields: Vec<String>,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            conflict_strategy: ConflictStrategy::FieldMerge,
            batch_eligible: true,
            delta_updates: true,
            pull_on_sync: false,
            bounds: None,
            schedule: None,
            critical_fields: Vec::new(),
        }
    }
}

impl EntityConfig {
    /// Creates a configuration at `priority`.
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Sets the conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Sets batch eligibility.
    pub fn with_batching(mut self, eligible: bool) -> Self {
        self.batch_eligible = eligible;
        self
    }

    /// Enables or disables delta-encoded updates.
    pub fn with_delta_updates(mut self, enabled: bool) -> Self {
        self.delta_updates = enabled;
        self
    }

    /// Pulls before pushing on scheduled syncs.
    pub fn with_pull_on_sync(mut self, enabled: bool) -> Self {
        self.pull_on_sync = enabled;
        self
    }

    /// Sets interval bounds.
    pub fn with_bounds(mut self, bounds: IntervalBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Sets the schedule strategy.
    pub fn with_schedule(mut self, strategy: ScheduleStrategy) -> Self {
        self.schedule = Some(strategy);
        self
    }

    /// Marks a field as critical.
    pub fn with_critical_field(mut self, field: impl Into<String>) -> Self {
        self.critical_fields.push(field.into());
        self
    }

    /// Scheduler registration for this entity.
    pub fn schedule_options(&self) -> EntitySchedule {
        EntitySchedule {
            priority: self.priority,
            bounds: self.bounds,
            strategy: self.schedule.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_defaults() {
        let config = EntityConfig::default();
        assert_eq!(config.priority, Priority::Normal);
        assert_eq!(config.conflict_strategy, ConflictStrategy::FieldMerge);
        assert!(config.batch_eligible);
        assert!(config.delta_updates);
    }

    #[test]
    fn entity_builders() {
        let config = EntityConfig::new(Priority::Critical)
            .with_conflict_strategy(ConflictStrategy::RemoteWins)
            .with_batching(false)
            .with_schedule(ScheduleStrategy::Manual)
            .with_critical_field("balance");
        let options = config.schedule_options();
        assert_eq!(options.priority, Priority::Critical);
        assert_eq!(options.strategy, Some(ScheduleStrategy::Manual));
        assert_eq!(config.critical_fields, vec!["balance".to_string()]);
    }

    #[test]
    fn engine_config_from_partial_json() {
        let config: EngineConfig = serde_json::from_str(r#"{"tick_ms": 250, "batch": {"chunk_size": 3}}"#).unwrap();
        assert_eq!(config.tick(), Duration::from_millis(250));
        assert_eq!(config.batch.chunk_size, 3);
        assert_eq!(config.event_capacity, 1024);
    }
}
