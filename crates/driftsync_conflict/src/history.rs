//! Bounded record of past resolutions.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::case::ConflictShape;
use crate::strategy::MergeStrategy;

/// Whether a resolution held up after resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// The resolved payload was accepted by the backend.
    Succeeded,
    /// The resolved payload was rejected or conflicted again.
    Failed,
}

/// One past resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    /// Case that was resolved.
    pub case_id: Uuid,
    /// Collection name.
    pub collection: String,
    /// Resolver that produced the result.
    pub resolver: String,
    /// Field strategies the resolution used.
    #[serde(default)]
    pub strategies: Vec<MergeStrategy>,
    /// Shape of the case.
    pub shape: ConflictShape,
    /// Confidence reported at resolution time.
    pub confidence: f64,
    /// Observed outcome.
    pub outcome: ResolutionOutcome,
    /// When the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Resolver suggested for a new case from its nearest neighbours.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySuggestion {
    /// Resolver name.
    pub resolver: String,
    /// Success rate of that resolver among the neighbours.
    pub success_rate: f64,
    /// Number of neighbours that used the resolver.
    pub samples: usize,
}

/// Thread-safe, bounded resolution history.
///
/// The oldest records are dropped once `capacity` is reached.
#[derive(Debug)]
pub struct ResolutionHistory {
    records: RwLock<VecDeque<ResolutionRecord>>,
    capacity: usize,
}

impl ResolutionHistory {
    /// Creates an empty history.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Appends a record, dropping the oldest when full.
    pub fn record(&self, record: ResolutionRecord) {
        let mut records = self.records.write();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Success rate and sample count of `resolver` on `collection`.
    pub fn success_rate(&self, collection: &str, resolver: &str) -> (f64, usize) {
        let records = self.records.read();
        let mut total = 0usize;
        let mut succeeded = 0usize;
        for record in records
            .iter()
            .filter(|r| r.collection == collection && r.resolver == resolver)
        {
            total += 1;
            if record.outcome == ResolutionOutcome::Succeeded {
                succeeded += 1;
            }
        }
        if total == 0 {
            (0.0, 0)
        } else {
            (succeeded as f64 / total as f64, total)
        }
    }

    /// Success rate and sample count of resolutions on `collection` that
    /// used `strategy` for at least one field.
    pub fn strategy_success_rate(&self, collection: &str, strategy: MergeStrategy) -> (f64, usize) {
        let records = self.records.read();
        let (succeeded, total) = records
            .iter()
            .filter(|r| r.collection == collection && r.strategies.contains(&strategy))
            .fold((0usize, 0usize), |(succeeded, total), r| {
                let ok = usize::from(r.outcome == ResolutionOutcome::Succeeded);
                (succeeded + ok, total + 1)
            });
        if total == 0 {
            (0.0, 0)
        } else {
            (succeeded as f64 / total as f64, total)
        }
    }

    /// Suggests a resolver from the `k` nearest past cases of the same
    /// collection.
    ///
    /// Returns the resolver with the best success rate among those
    /// neighbours. Ties go to the resolver with more samples.
    pub fn suggest(&self, collection: &str, shape: &ConflictShape, k: usize) -> Option<StrategySuggestion> {
        if k == 0 {
            return None;
        }
        let records = self.records.read();
        let mut neighbours: Vec<(f64, &ResolutionRecord)> = records
            .iter()
            .filter(|r| r.collection == collection)
            .map(|r| (r.shape.distance(shape), r))
            .collect();
        neighbours.sort_by(|a, b| a.0.total_cmp(&b.0));
        neighbours.truncate(k);

        let mut tally: HashMap<&str, (usize, usize)> = HashMap::new();
        for (_, record) in &neighbours {
            let entry = tally.entry(record.resolver.as_str()).or_insert((0, 0));
            entry.1 += 1;
            if record.outcome == ResolutionOutcome::Succeeded {
                entry.0 += 1;
            }
        }

        tally
            .into_iter()
            .map(|(resolver, (succeeded, samples))| StrategySuggestion {
                resolver: resolver.to_string(),
                success_rate: succeeded as f64 / samples as f64,
                samples,
            })
            .max_by(|a, b| {
                a.success_rate
                    .total_cmp(&b.success_rate)
                    .then(a.samples.cmp(&b.samples))
                    .then(b.resolver.cmp(&a.resolver))
            })
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if no records are held.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Removes every record.
    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl Default for ResolutionHistory {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn shape(fields: &[&str]) -> ConflictShape {
        ConflictShape {
            fields: fields.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>(),
            ..Default::default()
        }
    }

    fn record(collection: &str, resolver: &str, fields: &[&str], outcome: ResolutionOutcome) -> ResolutionRecord {
        ResolutionRecord {
            case_id: Uuid::new_v4(),
            collection: collection.into(),
            resolver: resolver.into(),
            strategies: vec![MergeStrategy::Text],
            shape: shape(fields),
            confidence: 0.8,
            outcome,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn bounded_capacity() {
        let history = ResolutionHistory::new(2);
        for _ in 0..5 {
            history.record(record("c", "field_merge", &["a"], ResolutionOutcome::Succeeded));
        }
        assert_eq!(history.len(), 2);
        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn success_rate_per_collection_and_resolver() {
        let history = ResolutionHistory::default();
        history.record(record("c", "field_merge", &["a"], ResolutionOutcome::Succeeded));
        history.record(record("c", "field_merge", &["a"], ResolutionOutcome::Failed));
        history.record(record("other", "field_merge", &["a"], ResolutionOutcome::Failed));

        assert_eq!(history.success_rate("c", "field_merge"), (0.5, 2));
        assert_eq!(history.success_rate("c", "remote_wins"), (0.0, 0));
    }

    #[test]
    fn success_rate_per_strategy() {
        let history = ResolutionHistory::default();
        history.record(record("c", "field_merge", &["a"], ResolutionOutcome::Failed));
        let mut numeric = record("c", "field_merge", &["n"], ResolutionOutcome::Succeeded);
        numeric.strategies = vec![MergeStrategy::Numeric, MergeStrategy::Text];
        history.record(numeric);

        assert_eq!(history.strategy_success_rate("c", MergeStrategy::Text), (0.5, 2));
        assert_eq!(history.strategy_success_rate("c", MergeStrategy::Numeric), (1.0, 1));
        assert_eq!(history.strategy_success_rate("c", MergeStrategy::KeyedList), (0.0, 0));
        assert_eq!(history.strategy_success_rate("other", MergeStrategy::Text), (0.0, 0));
    }

    #[test]
    fn suggests_best_resolver_among_neighbours() {
        let history = ResolutionHistory::default();
        history.record(record("c", "field_merge", &["title"], ResolutionOutcome::Failed));
        history.record(record("c", "remote_wins", &["title"], ResolutionOutcome::Succeeded));
        history.record(record("c", "remote_wins", &["title"], ResolutionOutcome::Succeeded));
        history.record(record("c", "field_merge", &["tags", "count"], ResolutionOutcome::Succeeded));

        let suggestion = history.suggest("c", &shape(&["title"]), 3).unwrap();
        assert_eq!(suggestion.resolver, "remote_wins");
        assert_eq!(suggestion.success_rate, 1.0);
        assert_eq!(suggestion.samples, 2);

        assert!(history.suggest("missing", &shape(&["title"]), 3).is_none());
    }
}
