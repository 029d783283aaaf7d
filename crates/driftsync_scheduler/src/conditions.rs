//! Network and power condition buckets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network quality bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    /// No connectivity.
    Offline,
    /// High latency or loss.
    Poor,
    /// Usable but constrained.
    Fair,
    /// Normal connectivity.
    #[default]
    Good,
    /// Fast, unmetered connectivity.
    Excellent,
}

/// Power bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Battery critically low.
    Critical,
    /// Battery low.
    Low,
    /// Normal battery.
    #[default]
    Normal,
    /// On external power.
    Charging,
}

/// Current system conditions, as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemConditions {
    /// Network bucket.
    pub network: NetworkQuality,
    /// Power bucket.
    pub power: PowerState,
}

impl SystemConditions {
    /// Creates a condition snapshot.
    pub fn new(network: NetworkQuality, power: PowerState) -> Self {
        Self { network, power }
    }

    /// Returns true if the device has no connectivity.
    pub fn is_offline(&self) -> bool {
        self.network == NetworkQuality::Offline
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkQuality::Offline => "offline",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Good => "good",
            NetworkQuality::Excellent => "excellent",
        };
        f.write_str(name)
    }
}

impl FromStr for NetworkQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "offline" => Ok(NetworkQuality::Offline),
            "poor" => Ok(NetworkQuality::Poor),
            "fair" => Ok(NetworkQuality::Fair),
            "good" => Ok(NetworkQuality::Good),
            "excellent" => Ok(NetworkQuality::Excellent),
            other => Err(format!("unknown network quality: {other}")),
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::Critical => "critical",
            PowerState::Low => "low",
            PowerState::Normal => "normal",
            PowerState::Charging => "charging",
        };
        f.write_str(name)
    }
}

impl FromStr for PowerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(PowerState::Critical),
            "low" => Ok(PowerState::Low),
            "normal" => Ok(PowerState::Normal),
            "charging" => Ok(PowerState::Charging),
            other => Err(format!("unknown power state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        for quality in ["offline", "poor", "fair", "good", "excellent"] {
            assert_eq!(quality.parse::<NetworkQuality>().unwrap().to_string(), quality);
        }
        for state in ["critical", "low", "normal", "charging"] {
            assert_eq!(state.parse::<PowerState>().unwrap().to_string(), state);
        }
        assert!("wifi".parse::<NetworkQuality>().is_err());
    }

    #[test]
    fn defaults() {
        let conditions = SystemConditions::default();
        assert_eq!(conditions.network, NetworkQuality::Good);
        assert_eq!(conditions.power, PowerState::Normal);
        assert!(!conditions.is_offline());
    }
}
