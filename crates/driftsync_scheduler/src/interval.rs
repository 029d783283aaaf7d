//! Interval computation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::conditions::SystemConditions;
use crate::config::{IntervalBounds, SchedulerConfig};

/// Usage and reliability signals for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IntervalSignals {
    /// Observed local changes per hour.
    pub changes_per_hour: f64,
    /// Rolling success rate, `None` without enough history.
    pub success_rate: Option<f64>,
}

/// Every factor that went into an interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalBreakdown {
    /// Base interval for the priority, in milliseconds.
    pub base_ms: u64,
    /// Usage factor.
    pub usage_factor: f64,
    /// Reliability factor.
    pub reliability_factor: f64,
    /// Network multiplier.
    pub network_factor: f64,
    /// Power multiplier.
    pub power_factor: f64,
    /// Interval before clamping, in milliseconds.
    pub unclamped_ms: f64,
    /// Final interval, in milliseconds.
    pub interval_ms: u64,
}

impl IntervalBreakdown {
    /// Final interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Computes the sync interval for an entity.
///
/// The result always lies within `bounds`, whatever the inputs.
pub fn compute_interval(
    config: &SchedulerConfig,
    bounds: &IntervalBounds,
    signals: &IntervalSignals,
    conditions: &SystemConditions,
) -> Duration {
    explain_interval(config, bounds, signals, conditions).interval()
}

/// Like [`compute_interval`], returning each factor.
pub fn explain_interval(
    config: &SchedulerConfig,
    bounds: &IntervalBounds,
    signals: &IntervalSignals,
    conditions: &SystemConditions,
) -> IntervalBreakdown {
    let bounds = bounds.normalized();
    let usage_factor = config.usage.factor(signals.changes_per_hour);
    let reliability_factor = signals
        .success_rate
        .map_or(1.0, |rate| config.reliability.factor(rate));
    let network_factor = config.conditions.network(conditions.network);
    let power_factor = config.conditions.power(conditions.power);

    let unclamped =
        bounds.base_ms as f64 * usage_factor * reliability_factor * network_factor * power_factor;
    let interval_ms = if unclamped.is_finite() {
        unclamped.clamp(bounds.min_ms as f64, bounds.max_ms as f64) as u64
    } else {
        bounds.max_ms
    };

    IntervalBreakdown {
        base_ms: bounds.base_ms,
        usage_factor,
        reliability_factor,
        network_factor,
        power_factor,
        unclamped_ms: unclamped,
        interval_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{NetworkQuality, PowerState};
    use driftsync_queue::Priority;

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    #[test]
    fn base_interval_under_neutral_conditions() {
        let config = SchedulerConfig::default();
        let signals = IntervalSignals {
            changes_per_hour: 1.0,
            success_rate: Some(1.0),
        };
        let interval = compute_interval(
            &config,
            &config.bounds(Priority::Normal),
            &signals,
            &SystemConditions::default(),
        );
        assert_eq!(interval, minutes(15));
    }

    #[test]
    fn busy_entity_syncs_more_often() {
        let config = SchedulerConfig::default();
        let busy = IntervalSignals {
            changes_per_hour: 30.0,
            success_rate: None,
        };
        let interval = compute_interval(
            &config,
            &config.bounds(Priority::Normal),
            &busy,
            &SystemConditions::default(),
        );
        assert_eq!(interval, Duration::from_secs(450));
    }

    #[test]
    fn failing_path_and_poor_conditions_lengthen() {
        let config = SchedulerConfig::default();
        let signals = IntervalSignals {
            changes_per_hour: 1.0,
            success_rate: Some(0.3),
        };
        let conditions = SystemConditions::new(NetworkQuality::Poor, PowerState::Low);
        let breakdown = explain_interval(&config, &config.bounds(Priority::Normal), &signals, &conditions);
        assert_eq!(breakdown.reliability_factor, 2.0);
        assert_eq!(breakdown.network_factor, 2.0);
        assert_eq!(breakdown.power_factor, 2.0);
        // 15m * 8 = 120m, exactly the normal upper bound.
        assert_eq!(breakdown.interval(), minutes(120));
    }

    #[test]
    fn clamps_to_bounds() {
        let config = SchedulerConfig::default();
        let bounds = config.bounds(Priority::Critical);
        let offline = SystemConditions::new(NetworkQuality::Offline, PowerState::Critical);
        let slow = compute_interval(&config, &bounds, &IntervalSignals::default(), &offline);
        assert_eq!(slow, bounds.max());

        let tight = IntervalBounds::new(
            Duration::from_secs(20),
            Duration::from_secs(15),
            Duration::from_secs(60),
        );
        let excellent = SystemConditions::new(NetworkQuality::Excellent, PowerState::Charging);
        let busy = IntervalSignals {
            changes_per_hour: 100.0,
            success_rate: Some(1.0),
        };
        // 20s * 0.5 * 0.8 * 0.8 = 6.4s, below the 15s floor.
        assert_eq!(compute_interval(&config, &tight, &busy, &excellent), tight.min());
    }

    #[test]
    fn non_finite_inputs_stay_bounded() {
        let mut config = SchedulerConfig::default();
        config.conditions.good = f64::INFINITY;
        let bounds = config.bounds(Priority::High);
        let interval = compute_interval(&config, &bounds, &IntervalSignals::default(), &SystemConditions::default());
        assert_eq!(interval, bounds.max());
    }
}
