//! Configuration for the sync queue.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::item::Priority;

/// Limits for one priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Maximum queued items in the tier.
    pub max_queued: usize,
    /// Maximum concurrent in-flight items (permit count).
    pub max_concurrent: usize,
}

impl TierConfig {
    /// Creates tier limits.
    pub fn new(max_queued: usize, max_concurrent: usize) -> Self {
        Self {
            max_queued,
            max_concurrent,
        }
    }
}

/// Configuration for the sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Critical tier limits.
    pub critical: TierConfig,
    /// High tier limits.
    pub high: TierConfig,
    /// Normal tier limits.
    pub normal: TierConfig,
    /// Low tier limits.
    pub low: TierConfig,
    /// Maximum non-terminal items across all tiers.
    pub total_capacity: usize,
    /// Maximum dead-lettered items kept; the oldest are dropped.
    pub dead_letter_capacity: usize,
    /// Conflict resolutions before an item is parked regardless of confidence.
    pub max_conflict_requeues: u32,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Overload rebalancing.
    pub overload: OverloadConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            critical: TierConfig::new(1_000, 8),
            high: TierConfig::new(2_000, 6),
            normal: TierConfig::new(5_000, 4),
            low: TierConfig::new(5_000, 2),
            total_capacity: 10_000,
            dead_letter_capacity: 500,
            max_conflict_requeues: 3,
            retry: RetryConfig::default(),
            overload: OverloadConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Limits for `priority`.
    pub fn tier(&self, priority: Priority) -> TierConfig {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    /// Sets the limits for one tier.
    pub fn with_tier(mut self, priority: Priority, tier: TierConfig) -> Self {
        match priority {
            Priority::Critical => self.critical = tier,
            Priority::High => self.high = tier,
            Priority::Normal => self.normal = tier,
            Priority::Low => self.low = tier,
        }
        self
    }

    /// Sets the shared capacity.
    pub fn with_total_capacity(mut self, capacity: usize) -> Self {
        self.total_capacity = capacity;
        self
    }

    /// Sets the dead-letter bound.
    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }

    /// Sets the conflict requeue limit.
    pub fn with_max_conflict_requeues(mut self, limit: u32) -> Self {
        self.max_conflict_requeues = limit;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the overload configuration.
    pub fn with_overload(mut self, overload: OverloadConfig) -> Self {
        self.overload = overload;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Maximum jitter as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.25,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter_ratio: 0.0,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter ratio.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Base delay as a `Duration`.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum delay as a `Duration`.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before retry number `retry` (0-indexed), without jitter.
    ///
    /// `base * multiplier^retry`, capped at the maximum delay.
    pub fn base_delay_for_attempt(&self, retry: u32) -> Duration {
        let max = self.max_delay_ms as f64;
        let exponent = retry.min(i32::MAX as u32) as i32;
        let delay = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = if delay.is_finite() { delay.min(max) } else { max };
        Duration::from_millis(delay as u64)
    }

    /// Delay before retry number `retry` (0-indexed), with random jitter.
    ///
    /// Never shorter than [`base_delay_for_attempt`](Self::base_delay_for_attempt)
    /// and never longer than the maximum delay.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.base_delay_for_attempt(retry);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || base.is_zero() {
            return base;
        }
        let jitter = base.as_secs_f64() * ratio * rand::thread_rng().gen_range(0.0..=1.0);
        (base + Duration::from_secs_f64(jitter)).min(self.max_delay().max(base))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Dynamic cap adjustment under sustained backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverloadConfig {
    /// Whether rebalancing is active.
    pub enabled: bool,
    /// Queued items above which the queue counts as overloaded.
    pub backlog_threshold: usize,
    /// Consecutive overloaded checks before caps change.
    pub sustain_checks: u32,
    /// Factor applied to critical and high caps.
    pub widen_factor: f64,
    /// Factor applied to normal and low caps.
    pub narrow_factor: f64,
}

impl Default for OverloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backlog_threshold: 1_000,
            sustain_checks: 3,
            widen_factor: 1.5,
            narrow_factor: 0.5,
        }
    }
}

impl OverloadConfig {
    /// Adjusted cap for `priority` while overloaded. Never below one.
    pub fn overloaded_cap(&self, priority: Priority, base: usize) -> usize {
        let factor = match priority {
            Priority::Critical | Priority::High => self.widen_factor.max(1.0),
            Priority::Normal | Priority::Low => self.narrow_factor.clamp(0.0, 1.0),
        };
        ((base as f64 * factor).round() as usize).max(1)
    }
}
