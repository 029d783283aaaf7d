//! Configuration for conflict resolution.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How two diverging numbers are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericPolicy {
    /// Take the larger value.
    Max,
    /// Take the smaller value.
    Min,
    /// Take the arithmetic mean.
    Average,
    /// Take the value with the larger magnitude, treating it as more complete.
    PreferLarger,
}

/// How two diverging booleans are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanPolicy {
    /// True if either side is true ("enabled" wins).
    Or,
    /// True only if both sides are true.
    And,
    /// Keep the local value.
    PreferLocal,
    /// Keep the remote value.
    PreferRemote,
}

/// Confidence assigned to each merge strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfidence {
    /// Id-keyed object lists.
    pub keyed_list: f64,
    /// Timestamp-ordered object lists.
    pub recency_list: f64,
    /// Plain list union.
    pub list_union: f64,
    /// Numeric policy.
    pub numeric: f64,
    /// Text where both sides are highly similar.
    pub text_similar: f64,
    /// Text where the sides diverge.
    pub text_divergent: f64,
    /// Boolean policy.
    pub boolean: f64,
    /// Chronologically later timestamp.
    pub timestamp: f64,
    /// Record-level latest-timestamp fallback for opaque values.
    pub fallback: f64,
}

impl Default for StrategyConfidence {
    fn default() -> Self {
        Self {
            keyed_list: 0.9,
            recency_list: 0.85,
            list_union: 0.8,
            numeric: 0.7,
            text_similar: 0.8,
            text_divergent: 0.55,
            boolean: 0.75,
            timestamp: 0.95,
            fallback: 0.4,
        }
    }
}

/// Weights of the aggregate confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Fraction of fields resolved by high-confidence strategies.
    pub high_confidence_fraction: f64,
    /// Mean per-field confidence.
    pub mean_confidence: f64,
    /// Historical success rate of the resolver on the collection.
    pub history: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            high_confidence_fraction: 0.5,
            mean_confidence: 0.3,
            history: 0.2,
        }
    }
}

/// Configuration for conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Minimum confidence for an automatic merge.
    pub auto_merge_threshold: f64,
    /// Minimum per-field confidence counted as "high confidence".
    pub high_confidence_threshold: f64,
    /// Text similarity at or above which remote text is preferred.
    pub text_similarity_threshold: f64,
    /// Default numeric policy.
    pub numeric_policy: NumericPolicy,
    /// Default boolean policy.
    pub boolean_policy: BooleanPolicy,
    /// Per-field numeric policy overrides.
    pub numeric_fields: HashMap<String, NumericPolicy>,
    /// Per-field boolean policy overrides.
    pub boolean_fields: HashMap<String, BooleanPolicy>,
    /// Fields whose true conflicts require human review.
    pub critical_fields: HashSet<String>,
    /// Multiplier applied to the score when a critical field conflicts.
    pub critical_penalty: f64,
    /// Per-strategy confidence.
    pub strategy_confidence: StrategyConfidence,
    /// Aggregate score weights.
    pub weights: ScoreWeights,
    /// Minimum history samples before history affects the score.
    pub min_history_samples: usize,
    /// Number of neighbours considered for suggestions.
    pub suggestion_neighbors: usize,
    /// Minimum success rate for a suggested resolver to be used.
    pub suggestion_floor: f64,
    /// Whether the registry follows history suggestions.
    pub use_history_suggestions: bool,
    /// Maximum number of history records kept.
    pub history_capacity: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            auto_merge_threshold: 0.7,
            high_confidence_threshold: 0.75,
            text_similarity_threshold: 0.8,
            numeric_policy: NumericPolicy::Max,
            boolean_policy: BooleanPolicy::Or,
            numeric_fields: HashMap::new(),
            boolean_fields: HashMap::new(),
            critical_fields: HashSet::new(),
            critical_penalty: 0.5,
            strategy_confidence: StrategyConfidence::default(),
            weights: ScoreWeights::default(),
            min_history_samples: 5,
            suggestion_neighbors: 5,
            suggestion_floor: 0.8,
            use_history_suggestions: false,
            history_capacity: 1000,
        }
    }
}

impl ResolverConfig {
    /// Sets the auto-merge threshold.
    pub fn with_auto_merge_threshold(mut self, threshold: f64) -> Self {
        self.auto_merge_threshold = threshold;
        self
    }

    /// Sets the default numeric policy.
    pub fn with_numeric_policy(mut self, policy: NumericPolicy) -> Self {
        self.numeric_policy = policy;
        self
    }

    /// Sets the default boolean policy.
    pub fn with_boolean_policy(mut self, policy: BooleanPolicy) -> Self {
        self.boolean_policy = policy;
        self
    }

    /// Overrides the numeric policy for one field.
    pub fn with_numeric_field(mut self, field: impl Into<String>, policy: NumericPolicy) -> Self {
        self.numeric_fields.insert(field.into(), policy);
        self
    }

    /// Overrides the boolean policy for one field.
    pub fn with_boolean_field(mut self, field: impl Into<String>, policy: BooleanPolicy) -> Self {
        self.boolean_fields.insert(field.into(), policy);
        self
    }

    /// Marks a field as business-critical.
    pub fn with_critical_field(mut self, field: impl Into<String>) -> Self {
        self.critical_fields.insert(field.into());
        self
    }

    /// Enables history-guided resolver selection.
    pub fn with_history_suggestions(mut self, enabled: bool) -> Self {
        self.use_history_suggestions = enabled;
        self
    }

    /// Numeric policy in effect for `field`.
    pub fn numeric_policy_for(&self, field: &str) -> NumericPolicy {
        self.numeric_fields
            .get(field)
            .copied()
            .unwrap_or(self.numeric_policy)
    }

    /// Boolean policy in effect for `field`.
    pub fn boolean_policy_for(&self, field: &str) -> BooleanPolicy {
        self.boolean_fields
            .get(field)
            .copied()
            .unwrap_or(self.boolean_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_overrides() {
        let config = ResolverConfig::default()
            .with_numeric_field("balance", NumericPolicy::Min)
            .with_boolean_field("archived", BooleanPolicy::And);

        assert_eq!(config.numeric_policy_for("balance"), NumericPolicy::Min);
        assert_eq!(config.numeric_policy_for("count"), NumericPolicy::Max);
        assert_eq!(config.boolean_policy_for("archived"), BooleanPolicy::And);
        assert_eq!(config.boolean_policy_for("enabled"), BooleanPolicy::Or);
    }

    #[test]
    fn deserializes_partial_config() {
        let config: ResolverConfig =
            serde_json::from_str(r#"{"auto_merge_threshold": 0.9, "numeric_policy": "average"}"#)
                .unwrap();
        assert_eq!(config.auto_merge_threshold, 0.9);
        assert_eq!(config.numeric_policy, NumericPolicy::Average);
        assert_eq!(config.boolean_policy, BooleanPolicy::Or);
    }
}
