//! Conflict resolvers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::case::ConflictCase;
use crate::config::ResolverConfig;
use crate::history::ResolutionHistory;
use crate::resolution::{EnhancedResolution, FieldResolution, Provenance, ResolutionAction};
use crate::strategy::{merge_payloads, record_timestamp, MergeContext, MergeStrategy};

/// A pluggable conflict resolver.
///
/// Resolvers never fail. Uncertainty is reported through
/// `EnhancedResolution::confidence`.
pub trait ConflictResolver: Send + Sync {
    /// Stable name, used for registry lookups and history.
    fn name(&self) -> &str;

    /// Resolves a case.
    fn resolve(&self, case: &ConflictCase) -> EnhancedResolution;
}

/// Which resolver an entity uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Field-level three-way merge with confidence scoring.
    #[default]
    FieldMerge,
    /// Whole-record latest timestamp wins.
    LastWriteWins,
    /// Local version always wins.
    LocalWins,
    /// Remote version always wins.
    RemoteWins,
    /// Every conflict is parked for a human.
    Manual,
}

impl ConflictStrategy {
    /// Builds the resolver for this strategy.
    pub fn build(
        self,
        config: ResolverConfig,
        history: Option<Arc<ResolutionHistory>>,
    ) -> Arc<dyn ConflictResolver> {
        match self {
            Self::FieldMerge => {
                let resolver = FieldMergeResolver::new(config);
                Arc::new(match history {
                    Some(history) => resolver.with_history(history),
                    None => resolver,
                })
            }
            Self::LastWriteWins => Arc::new(LastWriteWinsResolver),
            Self::LocalWins => Arc::new(LocalWinsResolver),
            Self::RemoteWins => Arc::new(RemoteWinsResolver),
            Self::Manual => Arc::new(ManualResolver),
        }
    }

    /// Name of the resolver this strategy builds.
    pub fn resolver_name(self) -> &'static str {
        match self {
            Self::FieldMerge => FieldMergeResolver::NAME,
            Self::LastWriteWins => LastWriteWinsResolver::NAME,
            Self::LocalWins => LocalWinsResolver::NAME,
            Self::RemoteWins => RemoteWinsResolver::NAME,
            Self::Manual => ManualResolver::NAME,
        }
    }
}

fn identical(case: &ConflictCase, resolver: &str) -> EnhancedResolution {
    EnhancedResolution {
        case_id: case.id,
        collection: case.collection.clone(),
        record_id: case.record_id.clone(),
        resolver: resolver.to_string(),
        action: ResolutionAction::Merged,
        merged: case.local.clone(),
        confidence: 1.0,
        fields: Vec::new(),
    }
}

/// Whole-record resolution in favour of one side.
fn whole_record(case: &ConflictCase, resolver: &str, provenance: Provenance, confidence: f64) -> EnhancedResolution {
    let (action, merged) = match provenance {
        Provenance::Local => (ResolutionAction::UseLocal, case.local.clone()),
        _ => (ResolutionAction::UseRemote, case.remote.clone()),
    };
    EnhancedResolution {
        case_id: case.id,
        collection: case.collection.clone(),
        record_id: case.record_id.clone(),
        resolver: resolver.to_string(),
        action,
        merged,
        confidence,
        fields: case
            .fields
            .iter()
            .map(|field| FieldResolution {
                path: field.field.clone(),
                strategy: MergeStrategy::FixedPolicy,
                provenance,
                confidence,
            })
            .collect(),
    }
}

/// Field-level three-way merge resolver.
#[derive(Debug, Clone, Default)]
pub struct FieldMergeResolver {
    config: ResolverConfig,
    history: Option<Arc<ResolutionHistory>>,
}

impl FieldMergeResolver {
    /// Registry name.
    pub const NAME: &'static str = "field_merge";

    /// Creates a resolver.
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            history: None,
        }
    }

    /// Feeds historical success rates into the confidence score.
    pub fn with_history(mut self, history: Arc<ResolutionHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    fn score(&self, case: &ConflictCase, fields: &[FieldResolution]) -> f64 {
        if fields.is_empty() {
            return 1.0;
        }
        let weights = &self.config.weights;
        let n = fields.len() as f64;
        let high = fields
            .iter()
            .filter(|f| f.confidence >= self.config.high_confidence_threshold)
            .count() as f64;
        let mean = fields.iter().map(|f| f.confidence).sum::<f64>() / n;

        let mut weighted = weights.high_confidence_fraction * (high / n) + weights.mean_confidence * mean;
        let mut total = weights.high_confidence_fraction + weights.mean_confidence;

        // Each field is scored against past outcomes of its own strategy.
        if let Some(history) = &self.history {
            let rates: Vec<f64> = fields
                .iter()
                .filter_map(|f| {
                    let (rate, samples) = history.strategy_success_rate(&case.collection, f.strategy);
                    (samples >= self.config.min_history_samples).then_some(rate)
                })
                .collect();
            if !rates.is_empty() {
                let rate = rates.iter().sum::<f64>() / rates.len() as f64;
                weighted += weights.history * rate;
                total += weights.history;
            }
        }

        let mut score = if total > 0.0 { weighted / total } else { mean };

        let critical = case
            .true_conflicts()
            .any(|f| self.config.critical_fields.contains(&f.field));
        if critical {
            score *= self.config.critical_penalty;
        }

        score.clamp(0.0, 1.0)
    }
}

impl ConflictResolver for FieldMergeResolver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn resolve(&self, case: &ConflictCase) -> EnhancedResolution {
        if case.is_identical() {
            return identical(case, Self::NAME);
        }

        let ctx = MergeContext {
            config: &self.config,
            local_record: &case.local,
            remote_record: &case.remote,
        };
        let mut fields = Vec::new();
        let merged = merge_payloads(&ctx, "", case.base.as_ref(), &case.local, &case.remote, &mut fields);
        let confidence = self.score(case, &fields);

        let action = if confidence < self.config.auto_merge_threshold {
            ResolutionAction::DeferredToManual
        } else if merged == case.local {
            ResolutionAction::UseLocal
        } else if merged == case.remote {
            ResolutionAction::UseRemote
        } else {
            ResolutionAction::Merged
        };

        tracing::debug!(
            collection = %case.collection,
            record_id = %case.record_id,
            fields = fields.len(),
            confidence,
            ?action,
            "field merge resolved conflict"
        );

        EnhancedResolution {
            case_id: case.id,
            collection: case.collection.clone(),
            record_id: case.record_id.clone(),
            resolver: Self::NAME.to_string(),
            action,
            merged,
            confidence,
            fields,
        }
    }
}

/// The side with the later record-level timestamp wins.
///
/// When neither side is timestamped, or they tie, the remote version wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWinsResolver;

impl LastWriteWinsResolver {
    /// Registry name.
    pub const NAME: &'static str = "last_write_wins";
}

impl ConflictResolver for LastWriteWinsResolver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn resolve(&self, case: &ConflictCase) -> EnhancedResolution {
        if case.is_identical() {
            return identical(case, Self::NAME);
        }
        let local_wins = match (record_timestamp(&case.local), record_timestamp(&case.remote)) {
            (Some(local), Some(remote)) => local > remote,
            (Some(_), None) => true,
            _ => false,
        };
        let provenance = if local_wins {
            Provenance::Local
        } else {
            Provenance::Remote
        };
        whole_record(case, Self::NAME, provenance, 1.0)
    }
}

/// The local version always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWinsResolver;

impl LocalWinsResolver {
    /// Registry name.
    pub const NAME: &'static str = "local_wins";
}

impl ConflictResolver for LocalWinsResolver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn resolve(&self, case: &ConflictCase) -> EnhancedResolution {
        if case.is_identical() {
            return identical(case, Self::NAME);
        }
        whole_record(case, Self::NAME, Provenance::Local, 1.0)
    }
}

/// The remote version always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWinsResolver;

impl RemoteWinsResolver {
    /// Registry name.
    pub const NAME: &'static str = "remote_wins";
}

impl ConflictResolver for RemoteWinsResolver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn resolve(&self, case: &ConflictCase) -> EnhancedResolution {
        if case.is_identical() {
            return identical(case, Self::NAME);
        }
        whole_record(case, Self::NAME, Provenance::Remote, 1.0)
    }
}

/// Defers every non-identical case. The local version is the suggestion.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualResolver;

impl ManualResolver {
    /// Registry name.
    pub const NAME: &'static str = "manual";
}

impl ConflictResolver for ManualResolver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn resolve(&self, case: &ConflictCase) -> EnhancedResolution {
        if case.is_identical() {
            return identical(case, Self::NAME);
        }
        let mut resolution = whole_record(case, Self::NAME, Provenance::Local, 0.0);
        resolution.action = ResolutionAction::DeferredToManual;
        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ResolutionOutcome, ResolutionRecord};
    use chrono::Utc;
    use driftsync_core::Payload;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn conflict(base: Option<Value>, local: Value, remote: Value) -> ConflictCase {
        ConflictCase::new("notes", "r1", base.map(payload), payload(local), payload(remote))
    }

    #[test]
    fn non_conflicting_changes_are_both_preserved() {
        let resolver = FieldMergeResolver::default();
        let case = conflict(
            Some(json!({"name": "A", "value": 1})),
            json!({"name": "A", "value": 2}),
            json!({"name": "B", "value": 1}),
        );

        let resolution = resolver.resolve(&case);
        assert_eq!(resolution.merged, payload(json!({"name": "B", "value": 2})));
        assert_eq!(resolution.action, ResolutionAction::Merged);
        assert!(resolution.confidence > resolver.config().auto_merge_threshold);
        assert_eq!(resolution.fields.len(), 2);
    }

    #[test]
    fn identical_case_is_a_noop() {
        let p = json!({"name": "A", "value": 1});
        let case = conflict(Some(p.clone()), p.clone(), p);

        for strategy in [
            ConflictStrategy::FieldMerge,
            ConflictStrategy::LastWriteWins,
            ConflictStrategy::Manual,
        ] {
            let resolution = strategy.build(ResolverConfig::default(), None).resolve(&case);
            assert_eq!(resolution.confidence, 1.0);
            assert!(resolution.is_noop());
            assert!(resolution.is_auto_resolved());
        }
    }

    #[test]
    fn low_confidence_defers_with_suggestion() {
        let resolver = FieldMergeResolver::default();
        let case = conflict(
            None,
            json!({"payload": null, "updated_at": "2024-01-02T00:00:00Z"}),
            json!({"payload": 5, "updated_at": "2024-01-01T00:00:00Z"}),
        );
        let resolution = resolver.resolve(&case);
        assert_eq!(resolution.action, ResolutionAction::DeferredToManual);
        assert!(resolution.confidence < 0.7);
        assert_eq!(resolution.merged["payload"], Value::Null);
    }

    #[test]
    fn critical_field_forces_review() {
        let config = ResolverConfig::default().with_critical_field("price");
        let resolver = FieldMergeResolver::new(config);
        let case = conflict(
            Some(json!({"price": 10})),
            json!({"price": 12}),
            json!({"price": 11}),
        );
        let resolution = resolver.resolve(&case);
        assert_eq!(resolution.action, ResolutionAction::DeferredToManual);
        assert_eq!(resolution.merged["price"], json!(12));
    }

    #[test]
    fn one_sided_critical_change_is_not_penalised() {
        let config = ResolverConfig::default().with_critical_field("price");
        let resolver = FieldMergeResolver::new(config);
        let case = conflict(
            Some(json!({"price": 10, "name": "a"})),
            json!({"price": 12, "name": "a"}),
            json!({"price": 10, "name": "b"}),
        );
        assert_eq!(resolver.resolve(&case).confidence, 1.0);
    }

    fn past_outcomes(history: &ResolutionHistory, strategy: MergeStrategy, outcome: ResolutionOutcome) {
        for _ in 0..5 {
            history.record(ResolutionRecord {
                case_id: uuid::Uuid::new_v4(),
                collection: "notes".into(),
                resolver: FieldMergeResolver::NAME.into(),
                strategies: vec![strategy],
                shape: Default::default(),
                confidence: 0.9,
                outcome,
                recorded_at: Utc::now(),
            });
        }
    }

    #[test]
    fn history_influences_score() {
        let history = Arc::new(ResolutionHistory::default());
        past_outcomes(&history, MergeStrategy::LocalChange, ResolutionOutcome::Failed);
        past_outcomes(&history, MergeStrategy::RemoteChange, ResolutionOutcome::Failed);
        let case = conflict(
            Some(json!({"name": "A", "value": 1})),
            json!({"name": "A", "value": 2}),
            json!({"name": "B", "value": 1}),
        );

        let without = FieldMergeResolver::default().resolve(&case).confidence;
        let with = FieldMergeResolver::default()
            .with_history(history)
            .resolve(&case)
            .confidence;
        assert_eq!(without, 1.0);
        assert!((with - 0.8).abs() < 1e-9);
    }

    #[test]
    fn history_is_matched_by_field_strategy() {
        let case = conflict(
            Some(json!({"title": "Weekly report"})),
            json!({"title": "Weekly report, final"}),
            json!({"title": "Weekly report (draft)"}),
        );
        let without = FieldMergeResolver::default().resolve(&case);
        assert_eq!(without.strategies(), vec![MergeStrategy::Text]);

        let numeric_failures = Arc::new(ResolutionHistory::default());
        past_outcomes(&numeric_failures, MergeStrategy::Numeric, ResolutionOutcome::Failed);
        let unrelated = FieldMergeResolver::default()
            .with_history(numeric_failures)
            .resolve(&case);
        assert_eq!(unrelated.confidence, without.confidence);

        let text_failures = Arc::new(ResolutionHistory::default());
        past_outcomes(&text_failures, MergeStrategy::Text, ResolutionOutcome::Failed);
        let related = FieldMergeResolver::default()
            .with_history(text_failures)
            .resolve(&case);
        assert!(related.confidence < without.confidence);
    }

    #[test]
    fn merge_equal_to_one_side_reports_that_side() {
        let resolver = FieldMergeResolver::default();
        let case = conflict(None, json!({"done": true}), json!({"done": false}));
        let resolution = resolver.resolve(&case);
        assert_eq!(resolution.action, ResolutionAction::UseLocal);
    }

    #[test]
    fn last_write_wins_by_record_timestamp() {
        let case = conflict(
            None,
            json!({"v": 1, "updated_at": "2024-01-02T00:00:00Z"}),
            json!({"v": 2, "updated_at": "2024-01-01T00:00:00Z"}),
        );
        let resolution = LastWriteWinsResolver.resolve(&case);
        assert_eq!(resolution.action, ResolutionAction::UseLocal);
        assert_eq!(resolution.merged["v"], json!(1));

        let untimed = conflict(None, json!({"v": 1}), json!({"v": 2}));
        assert_eq!(
            LastWriteWinsResolver.resolve(&untimed).action,
            ResolutionAction::UseRemote
        );
    }

    #[test]
    fn fixed_policies() {
        let case = conflict(None, json!({"v": 1}), json!({"v": 2}));
        assert_eq!(LocalWinsResolver.resolve(&case).merged["v"], json!(1));
        assert_eq!(RemoteWinsResolver.resolve(&case).merged["v"], json!(2));

        let manual = ManualResolver.resolve(&case);
        assert_eq!(manual.action, ResolutionAction::DeferredToManual);
        assert!(!manual.is_auto_resolved());
    }

    #[test]
    fn strategy_names_match_resolvers() {
        for strategy in [
            ConflictStrategy::FieldMerge,
            ConflictStrategy::LastWriteWins,
            ConflictStrategy::LocalWins,
            ConflictStrategy::RemoteWins,
            ConflictStrategy::Manual,
        ] {
            let resolver = strategy.build(ResolverConfig::default(), None);
            assert_eq!(resolver.name(), strategy.resolver_name());
        }
    }
}
