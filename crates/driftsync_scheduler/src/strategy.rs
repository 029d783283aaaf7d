//! Scheduling strategies.

use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How an entity's syncs are triggered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleStrategy {
    /// Fixed cadence, clamped to the entity's bounds.
    Fixed {
        /// Interval in milliseconds.
        interval_ms: u64,
    },
    /// Wall-clock trigger times (UTC).
    TimeOfDay {
        /// Trigger times.
        times: Vec<NaiveTime>,
    },
    /// Cadence computed from priority, usage, reliability and conditions.
    #[default]
    Adaptive,
    /// Never fires on its own.
    Manual,
    /// Fires after a debounced data-change notification.
    EventDriven {
        /// Quiet period in milliseconds.
        debounce_ms: u64,
    },
}

impl ScheduleStrategy {
    /// Fixed cadence.
    pub fn fixed(interval: Duration) -> Self {
        Self::Fixed {
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Event-driven with the given debounce.
    pub fn event_driven(debounce: Duration) -> Self {
        Self::EventDriven {
            debounce_ms: debounce.as_millis() as u64,
        }
    }

    /// Returns true if the strategy fires on a repeating timer.
    pub fn is_periodic(&self) -> bool {
        matches!(self, Self::Fixed { .. } | Self::Adaptive)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => "fixed",
            Self::TimeOfDay { .. } => "time_of_day",
            Self::Adaptive => "adaptive",
            Self::Manual => "manual",
            Self::EventDriven { .. } => "event_driven",
        }
    }
}

/// Next occurrence of any of `times` strictly after `now`.
pub fn next_time_of_day(times: &[NaiveTime], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    [0u64, 1]
        .iter()
        .filter_map(|days| today.checked_add_days(Days::new(*days)))
        .flat_map(|day| times.iter().map(move |time| day.and_time(*time).and_utc()))
        .filter(|candidate| *candidate > now)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn next_occurrence_today_or_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let times = [at(9, 0), at(18, 30)];
        assert_eq!(
            next_time_of_day(&times, now),
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 18, 30, 0).unwrap())
        );

        let evening = Utc.with_ymd_and_hms(2024, 3, 10, 19, 0, 0).unwrap();
        assert_eq!(
            next_time_of_day(&times, evening),
            Some(Utc.with_ymd_and_hms(2024, 3, 11, 9, 0, 0).unwrap())
        );
        assert_eq!(next_time_of_day(&[], now), None);
    }

    #[test]
    fn exact_match_moves_to_next() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();
        assert_eq!(
            next_time_of_day(&[at(9, 0)], now),
            Some(Utc.with_ymd_and_hms(2024, 3, 11, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn serde_shape() {
        let strategy: ScheduleStrategy =
            serde_json::from_str(r#"{"kind": "time_of_day", "times": ["08:00:00", "20:15:00"]}"#).unwrap();
        assert_eq!(
            strategy,
            ScheduleStrategy::TimeOfDay {
                times: vec![at(8, 0), at(20, 15)]
            }
        );
        assert!(!strategy.is_periodic());
        assert!(ScheduleStrategy::fixed(Duration::from_secs(5)).is_periodic());
        assert_eq!(ScheduleStrategy::default().name(), "adaptive");
    }
}
