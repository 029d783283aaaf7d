//! Configuration for the adaptive scheduler.

use driftsync_queue::Priority;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::conditions::{NetworkQuality, PowerState};

/// Interval bounds for one priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalBounds {
    /// Starting interval before adjustments, in milliseconds.
    pub base_ms: u64,
    /// Lower bound, in milliseconds.
    pub min_ms: u64,
    /// Upper bound, in milliseconds.
    pub max_ms: u64,
}

impl IntervalBounds {
    /// Creates bounds from durations.
    pub fn new(base: Duration, min: Duration, max: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            min_ms: min.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
        .normalized()
    }

    /// Swaps inverted bounds and pulls the base inside them.
    pub fn normalized(self) -> Self {
        let (min_ms, max_ms) = if self.min_ms <= self.max_ms {
            (self.min_ms, self.max_ms)
        } else {
            (self.max_ms, self.min_ms)
        };
        Self {
            base_ms: self.base_ms.clamp(min_ms, max_ms),
            min_ms,
            max_ms,
        }
    }

    /// Base interval.
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    /// Lower bound.
    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms.min(self.max_ms))
    }

    /// Upper bound.
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.min_ms))
    }

    /// Clamps `interval` into the bounds.
    pub fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min(), self.max())
    }
}

/// Usage-pattern adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageTuning {
    /// Changes per hour above which an entity counts as busy.
    pub busy_changes_per_hour: f64,
    /// Factor applied to busy entities.
    pub busy_factor: f64,
    /// Changes per hour above which an entity counts as active.
    pub active_changes_per_hour: f64,
    /// Factor applied to active entities.
    pub active_factor: f64,
    /// Changes per hour below which an entity counts as idle.
    pub idle_changes_per_hour: f64,
    /// Factor applied to idle entities.
    pub idle_factor: f64,
}

impl Default for UsageTuning {
    fn default() -> Self {
        Self {
            busy_changes_per_hour: 10.0,
            busy_factor: 0.5,
            active_changes_per_hour: 2.0,
            active_factor: 0.75,
            idle_changes_per_hour: 0.1,
            idle_factor: 1.5,
        }
    }
}

impl UsageTuning {
    /// Factor for a change rate.
    pub fn factor(&self, changes_per_hour: f64) -> f64 {
        if !changes_per_hour.is_finite() {
            return 1.0;
        }
        if changes_per_hour > self.busy_changes_per_hour {
            self.busy_factor
        } else if changes_per_hour > self.active_changes_per_hour {
            self.active_factor
        } else if changes_per_hour < self.idle_changes_per_hour {
            self.idle_factor
        } else {
            1.0
        }
    }
}

/// Reliability adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityTuning {
    /// Success rate below which the path counts as failing.
    pub failing_below: f64,
    /// Factor applied to failing paths.
    pub failing_factor: f64,
    /// Success rate below which the path counts as degraded.
    pub degraded_below: f64,
    /// Factor applied to degraded paths.
    pub degraded_factor: f64,
    /// Minimum outcomes before reliability is considered.
    pub min_samples: usize,
}

impl Default for ReliabilityTuning {
    fn default() -> Self {
        Self {
            failing_below: 0.5,
            failing_factor: 2.0,
            degraded_below: 0.8,
            degraded_factor: 1.5,
            min_samples: 3,
        }
    }
}

impl ReliabilityTuning {
    /// Factor for a success rate.
    pub fn factor(&self, success_rate: f64) -> f64 {
        if !success_rate.is_finite() {
            return 1.0;
        }
        if success_rate < self.failing_below {
            self.failing_factor
        } else if success_rate < self.degraded_below {
            self.degraded_factor
        } else {
            1.0
        }
    }
}

/// Discrete multipliers per condition bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionMultipliers {
    /// No connectivity.
    pub offline: f64,
    /// Poor network.
    pub poor: f64,
    /// Fair network.
    pub fair: f64,
    /// Good network.
    pub good: f64,
    /// Excellent network.
    pub excellent: f64,
    /// Battery critically low.
    pub power_critical: f64,
    /// Battery low.
    pub power_low: f64,
    /// Normal battery.
    pub power_normal: f64,
    /// Charging.
    pub charging: f64,
}

impl Default for ConditionMultipliers {
    fn default() -> Self {
        Self {
            offline: 8.0,
            poor: 2.0,
            fair: 1.25,
            good: 1.0,
            excellent: 0.8,
            power_critical: 4.0,
            power_low: 2.0,
            power_normal: 1.0,
            charging: 0.8,
        }
    }
}

impl ConditionMultipliers {
    /// Multiplier for a network bucket.
    pub fn network(&self, quality: NetworkQuality) -> f64 {
        match quality {
            NetworkQuality::Offline => self.offline,
            NetworkQuality::Poor => self.poor,
            NetworkQuality::Fair => self.fair,
            NetworkQuality::Good => self.good,
            NetworkQuality::Excellent => self.excellent,
        }
    }

    /// Multiplier for a power bucket.
    pub fn power(&self, state: PowerState) -> f64 {
        match state {
            PowerState::Critical => self.power_critical,
            PowerState::Low => self.power_low,
            PowerState::Normal => self.power_normal,
            PowerState::Charging => self.charging,
        }
    }
}

/// Configuration for the adaptive scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Bounds for critical entities.
    pub critical: IntervalBounds,
    /// Bounds for high-priority entities.
    pub high: IntervalBounds,
    /// Bounds for normal entities.
    pub normal: IntervalBounds,
    /// Bounds for low-priority entities.
    pub low: IntervalBounds,
    /// Usage adjustment.
    pub usage: UsageTuning,
    /// Reliability adjustment.
    pub reliability: ReliabilityTuning,
    /// Condition multipliers.
    pub conditions: ConditionMultipliers,
    /// Quiet period before a data change fires or triggers recalculation.
    pub debounce_ms: u64,
    /// Delay of the retry-flavored sync after a failure.
    pub retry_delay_ms: u64,
    /// Outcomes kept for the rolling success rate.
    pub metrics_window: usize,
    /// Longest span considered for the change rate, in hours.
    pub change_window_hours: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60_000;
        Self {
            critical: IntervalBounds {
                base_ms: MINUTE,
                min_ms: 15_000,
                max_ms: 10 * MINUTE,
            },
            high: IntervalBounds {
                base_ms: 5 * MINUTE,
                min_ms: MINUTE,
                max_ms: 30 * MINUTE,
            },
            normal: IntervalBounds {
                base_ms: 15 * MINUTE,
                min_ms: 5 * MINUTE,
                max_ms: 120 * MINUTE,
            },
            low: IntervalBounds {
                base_ms: 60 * MINUTE,
                min_ms: 15 * MINUTE,
                max_ms: 720 * MINUTE,
            },
            usage: UsageTuning::default(),
            reliability: ReliabilityTuning::default(),
            conditions: ConditionMultipliers::default(),
            debounce_ms: 2_000,
            retry_delay_ms: 30_000,
            metrics_window: 20,
            change_window_hours: 24,
        }
    }
}

impl SchedulerConfig {
    /// Bounds for `priority`, normalized.
    pub fn bounds(&self, priority: Priority) -> IntervalBounds {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
        .normalized()
    }

    /// Sets the bounds for one priority.
    pub fn with_bounds(mut self, priority: Priority, bounds: IntervalBounds) -> Self {
        match priority {
            Priority::Critical => self.critical = bounds,
            Priority::High => self.high = bounds,
            Priority::Normal => self.normal = bounds,
            Priority::Low => self.low = bounds,
        }
        self
    }

    /// Sets the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// Sets the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_bounds_are_normalized() {
        let bounds = IntervalBounds {
            base_ms: 10,
            min_ms: 500,
            max_ms: 100,
        }
        .normalized();
        assert_eq!((bounds.min_ms, bounds.max_ms, bounds.base_ms), (100, 500, 100));
        assert_eq!(bounds.clamp(Duration::from_secs(1)), Duration::from_millis(500));
    }

    #[test]
    fn usage_factor_buckets() {
        let usage = UsageTuning::default();
        assert_eq!(usage.factor(20.0), 0.5);
        assert_eq!(usage.factor(5.0), 0.75);
        assert_eq!(usage.factor(1.0), 1.0);
        assert_eq!(usage.factor(0.0), 1.5);
        assert_eq!(usage.factor(f64::NAN), 1.0);
    }

    #[test]
    fn reliability_factor_buckets() {
        let reliability = ReliabilityTuning::default();
        assert_eq!(reliability.factor(0.2), 2.0);
        assert_eq!(reliability.factor(0.6), 1.5);
        assert_eq!(reliability.factor(0.95), 1.0);
    }

    #[test]
    fn bounds_per_priority() {
        let config = SchedulerConfig::default();
        assert!(config.bounds(Priority::Critical).base() < config.bounds(Priority::Low).base());
        let custom = IntervalBounds::new(
            Duration::from_secs(10),
            Duration::from_secs(5),
            Duration::from_secs(20),
        );
        assert_eq!(config.with_bounds(Priority::Low, custom).bounds(Priority::Low), custom);
    }
}
