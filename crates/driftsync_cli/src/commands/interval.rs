//! Interval command implementation.

use driftsync_queue::Priority;
use driftsync_scheduler::{
    explain_interval, IntervalSignals, NetworkQuality, PowerState, SchedulerConfig, SystemConditions,
};
use serde_json::Value;

use super::CommandResult;

/// Runs the interval command with the default scheduler configuration.
pub fn run(
    priority: Priority,
    changes_per_hour: f64,
    success_rate: Option<f64>,
    network: NetworkQuality,
    power: PowerState,
) -> CommandResult<Value> {
    if !changes_per_hour.is_finite() || changes_per_hour < 0.0 {
        return Err(format!("changes per hour must be a non-negative number, got {changes_per_hour}").into());
    }
    if let Some(rate) = success_rate {
        if !(0.0..=1.0).contains(&rate) {
            return Err(format!("success rate must be within [0, 1], got {rate}").into());
        }
    }

    let config = SchedulerConfig::default();
    let bounds = config.bounds(priority);
    let signals = IntervalSignals {
        changes_per_hour,
        success_rate,
    };
    let conditions = SystemConditions::new(network, power);
    let breakdown = explain_interval(&config, &bounds, &signals, &conditions);

    let mut output = serde_json::Map::new();
    output.insert("priority".into(), Value::String(priority.to_string()));
    output.insert("bounds".into(), serde_json::to_value(bounds)?);
    output.insert("breakdown".into(), serde_json::to_value(breakdown)?);
    Ok(Value::Object(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval_ms(output: &Value) -> u64 {
        output["breakdown"]["interval_ms"].as_u64().unwrap()
    }

    #[test]
    fn poor_conditions_lengthen_the_interval() {
        let good = run(Priority::Normal, 0.0, None, NetworkQuality::Good, PowerState::Normal).unwrap();
        let poor = run(Priority::Normal, 0.0, None, NetworkQuality::Poor, PowerState::Low).unwrap();
        assert!(interval_ms(&poor) >= interval_ms(&good));
        assert_eq!(good["priority"], "normal");
    }

    #[test]
    fn interval_stays_within_bounds() {
        let output = run(Priority::Critical, 1.0e9, Some(1.0), NetworkQuality::Excellent, PowerState::Charging).unwrap();
        let min = output["bounds"]["min_ms"].as_u64().unwrap();
        let max = output["bounds"]["max_ms"].as_u64().unwrap();
        let interval = interval_ms(&output);
        assert!((min..=max).contains(&interval));
    }

    #[test]
    fn rejects_out_of_range_inputs() {
        assert!(run(Priority::Low, -1.0, None, NetworkQuality::Good, PowerState::Normal).is_err());
        assert!(run(Priority::Low, 0.0, Some(1.5), NetworkQuality::Good, PowerState::Normal).is_err());
    }
}
