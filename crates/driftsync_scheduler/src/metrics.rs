//! Rolling per-entity sync metrics.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::interval::IntervalSignals;

/// Rolling success, duration and change-frequency metrics.
#[derive(Debug, Clone)]
pub(crate) struct SyncMetrics {
    window: usize,
    change_window: ChronoDuration,
    outcomes: VecDeque<(bool, Duration)>,
    changes: VecDeque<DateTime<Utc>>,
    tracking_since: DateTime<Utc>,
    total_syncs: u64,
    consecutive_failures: u32,
    last_sync_at: Option<DateTime<Utc>>,
}

impl SyncMetrics {
    pub(crate) fn new(window: usize, change_window_hours: u32, now: DateTime<Utc>) -> Self {
        Self {
            window: window.max(1),
            change_window: ChronoDuration::hours(i64::from(change_window_hours.max(1))),
            outcomes: VecDeque::new(),
            changes: VecDeque::new(),
            tracking_since: now,
            total_syncs: 0,
            consecutive_failures: 0,
            last_sync_at: None,
        }
    }

    pub(crate) fn record_outcome(&mut self, success: bool, duration: Duration, now: DateTime<Utc>) {
        if self.outcomes.len() >= self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back((success, duration));
        self.total_syncs += 1;
        self.consecutive_failures = if success {
            0
        } else {
            self.consecutive_failures.saturating_add(1)
        };
        self.last_sync_at = Some(now);
    }

    pub(crate) fn record_change(&mut self, now: DateTime<Utc>) {
        self.changes.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.change_window;
        while self.changes.front().is_some_and(|at| *at < cutoff) {
            self.changes.pop_front();
        }
    }

    pub(crate) fn success_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let succeeded = self.outcomes.iter().filter(|(ok, _)| *ok).count();
        Some(succeeded as f64 / self.outcomes.len() as f64)
    }

    pub(crate) fn samples(&self) -> usize {
        self.outcomes.len()
    }

    pub(crate) fn average_duration(&self) -> Option<Duration> {
        if self.outcomes.is_empty() {
            return None;
        }
        let total: Duration = self.outcomes.iter().map(|(_, d)| *d).sum();
        Some(total / self.outcomes.len() as u32)
    }

    /// Changes per hour over the observed span, at least one hour and at
    /// most the change window.
    pub(crate) fn changes_per_hour(&self, now: DateTime<Utc>) -> f64 {
        let cutoff = now - self.change_window;
        let count = self.changes.iter().filter(|at| **at >= cutoff).count();
        let observed = (now - self.tracking_since).clamp(ChronoDuration::hours(1), self.change_window);
        count as f64 / (observed.num_seconds() as f64 / 3600.0)
    }

    pub(crate) fn signals(&self, now: DateTime<Utc>, min_samples: usize) -> IntervalSignals {
        IntervalSignals {
            changes_per_hour: self.changes_per_hour(now),
            success_rate: self
                .success_rate()
                .filter(|_| self.samples() >= min_samples),
        }
    }

    pub(crate) fn snapshot(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        MetricsSnapshot {
            success_rate: self.success_rate(),
            average_duration_ms: self.average_duration().map(|d| d.as_millis() as u64),
            changes_per_hour: self.changes_per_hour(now),
            total_syncs: self.total_syncs,
            consecutive_failures: self.consecutive_failures,
            last_sync_at: self.last_sync_at,
        }
    }
}

/// Point-in-time view of an entity's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Rolling success rate, `None` before the first sync.
    pub success_rate: Option<f64>,
    /// Rolling average sync duration.
    pub average_duration_ms: Option<u64>,
    /// Observed change frequency.
    pub changes_per_hour: f64,
    /// Syncs recorded since registration.
    pub total_syncs: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Time of the last recorded sync.
    pub last_sync_at: Option<DateTime<Utc>>,
}
