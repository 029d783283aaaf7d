//! # DriftSync Scheduler
//!
//! Decides when each registered entity should sync.
//!
//! Every entity has a priority with base, minimum and maximum intervals.
//! The adaptive strategy scales the base interval by how often the entity
//! changes, how reliably it has been syncing, and the current network and
//! power conditions, then clamps the result to the bounds. Fixed,
//! time-of-day, manual and event-driven strategies are also available,
//! globally or per entity.
//!
//! Time is always passed in by the caller, so the scheduler is fully
//! deterministic under test.
//!
//! ## Example
//!
//! ```rust
//! use chrono::Utc;
//! use driftsync_queue::Priority;
//! use driftsync_scheduler::{AdaptiveScheduler, EntitySchedule, SchedulerConfig};
//!
//! let scheduler = AdaptiveScheduler::new(SchedulerConfig::default());
//! let now = Utc::now();
//! let entry = scheduler
//!     .register("notes", EntitySchedule::new(Priority::High), now)
//!     .unwrap();
//! assert!(entry.interval() >= entry.bounds.min());
//! assert!(scheduler.poll_due(now).is_empty());
//! ```

mod conditions;
mod config;
mod error;
mod interval;
mod metrics;
mod scheduler;
mod strategy;

pub use conditions::{NetworkQuality, PowerState, SystemConditions};
pub use config::{ConditionMultipliers, IntervalBounds, ReliabilityTuning, SchedulerConfig, UsageTuning};
pub use error::{SchedulerError, SchedulerResult};
pub use interval::{compute_interval, explain_interval, IntervalBreakdown, IntervalSignals};
pub use metrics::MetricsSnapshot;
pub use scheduler::{
    AdaptiveScheduler, EntitySchedule, ScheduleEntry, ScheduleTrigger, SyncOutcome, TriggerReason,
};
pub use strategy::{next_time_of_day, ScheduleStrategy};
