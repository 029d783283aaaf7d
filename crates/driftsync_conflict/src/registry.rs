//! Resolver registry with per-collection overrides.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::case::ConflictCase;
use crate::config::ResolverConfig;
use crate::history::{ResolutionHistory, ResolutionOutcome, ResolutionRecord};
use crate::resolution::EnhancedResolution;
use crate::resolver::{ConflictResolver, ConflictStrategy};

const BUILTIN: [ConflictStrategy; 5] = [
    ConflictStrategy::FieldMerge,
    ConflictStrategy::LastWriteWins,
    ConflictStrategy::LocalWins,
    ConflictStrategy::RemoteWins,
    ConflictStrategy::Manual,
];

/// Selects a resolver per collection and records outcomes.
///
/// Lookup order: collection override, then (if enabled) the history
/// suggestion for a similar case, then the default resolver.
pub struct ResolverRegistry {
    config: ResolverConfig,
    default: RwLock<Arc<dyn ConflictResolver>>,
    named: RwLock<HashMap<String, Arc<dyn ConflictResolver>>>,
    overrides: RwLock<HashMap<String, Arc<dyn ConflictResolver>>>,
    history: Arc<ResolutionHistory>,
}

impl ResolverRegistry {
    /// Creates a registry with the built-in resolvers and a field-merge
    /// default.
    pub fn new(config: ResolverConfig) -> Self {
        let history = Arc::new(ResolutionHistory::new(config.history_capacity));
        let named: HashMap<String, Arc<dyn ConflictResolver>> = BUILTIN
            .iter()
            .map(|strategy| {
                let resolver = strategy.build(config.clone(), Some(Arc::clone(&history)));
                (resolver.name().to_string(), resolver)
            })
            .collect();
        let default = ConflictStrategy::FieldMerge.build(config.clone(), Some(Arc::clone(&history)));

        Self {
            config,
            default: RwLock::new(default),
            named: RwLock::new(named),
            overrides: RwLock::new(HashMap::new()),
            history,
        }
    }

    /// Returns the shared resolution history.
    pub fn history(&self) -> &Arc<ResolutionHistory> {
        &self.history
    }

    /// Returns the resolver configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Registers a custom resolver under its name.
    pub fn register(&self, resolver: Arc<dyn ConflictResolver>) {
        self.named.write().insert(resolver.name().to_string(), resolver);
    }

    /// Looks up a resolver by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ConflictResolver>> {
        self.named.read().get(name).cloned()
    }

    /// Replaces the default resolver.
    pub fn set_default(&self, resolver: Arc<dyn ConflictResolver>) {
        *self.default.write() = resolver;
    }

    /// Uses `resolver` for every case in `collection`.
    pub fn set_override(&self, collection: impl Into<String>, resolver: Arc<dyn ConflictResolver>) {
        self.overrides.write().insert(collection.into(), resolver);
    }

    /// Uses the built-in resolver for `strategy` in `collection`.
    pub fn set_strategy(&self, collection: impl Into<String>, strategy: ConflictStrategy) {
        let resolver = self
            .get(strategy.resolver_name())
            .unwrap_or_else(|| strategy.build(self.config.clone(), Some(Arc::clone(&self.history))));
        self.set_override(collection, resolver);
    }

    /// Removes the override for `collection`.
    pub fn clear_override(&self, collection: &str) -> bool {
        self.overrides.write().remove(collection).is_some()
    }

    /// Resolver that would handle `case`.
    pub fn resolver_for(&self, case: &ConflictCase) -> Arc<dyn ConflictResolver> {
        if let Some(resolver) = self.overrides.read().get(&case.collection) {
            return Arc::clone(resolver);
        }

        if self.config.use_history_suggestions {
            let suggestion = self.history.suggest(
                &case.collection,
                &case.shape(),
                self.config.suggestion_neighbors,
            );
            if let Some(suggestion) = suggestion.filter(|s| s.success_rate >= self.config.suggestion_floor) {
                if let Some(resolver) = self.get(&suggestion.resolver) {
                    tracing::debug!(
                        collection = %case.collection,
                        resolver = %suggestion.resolver,
                        success_rate = suggestion.success_rate,
                        samples = suggestion.samples,
                        "using history-suggested resolver"
                    );
                    return resolver;
                }
            }
        }

        Arc::clone(&self.default.read())
    }

    /// Resolves `case` with the selected resolver.
    pub fn resolve(&self, case: &ConflictCase) -> EnhancedResolution {
        let resolver = self.resolver_for(case);
        let resolution = resolver.resolve(case);
        tracing::debug!(
            collection = %case.collection,
            record_id = %case.record_id,
            resolver = resolver.name(),
            action = ?resolution.action,
            confidence = resolution.confidence,
            "conflict resolved"
        );
        resolution
    }

    /// Records whether a resolution was accepted after resubmission.
    pub fn record_outcome(&self, case: &ConflictCase, resolution: &EnhancedResolution, outcome: ResolutionOutcome) {
        self.history.record(ResolutionRecord {
            case_id: case.id,
            collection: case.collection.clone(),
            resolver: resolution.resolver.clone(),
            strategies: resolution.strategies(),
            shape: case.shape(),
            confidence: resolution.confidence,
            outcome,
            recorded_at: Utc::now(),
        });
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("default", &self.default.read().name())
            .field("overrides", &self.overrides.read().keys().collect::<Vec<_>>())
            .field("history", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolution::ResolutionAction;
    use crate::resolver::{LocalWinsResolver, RemoteWinsResolver};
    use driftsync_core::Payload;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn conflict(collection: &str) -> ConflictCase {
        ConflictCase::new(
            collection,
            "r1",
            None,
            payload(json!({"title": "draft one"})),
            payload(json!({"title": "final"})),
        )
    }

    #[test]
    fn default_and_override() {
        let registry = ResolverRegistry::default();
        assert_eq!(registry.resolver_for(&conflict("notes")).name(), "field_merge");

        registry.set_strategy("notes", ConflictStrategy::LocalWins);
        let resolution = registry.resolve(&conflict("notes"));
        assert_eq!(resolution.resolver, LocalWinsResolver::NAME);
        assert_eq!(resolution.action, ResolutionAction::UseLocal);

        assert!(registry.clear_override("notes"));
        assert!(!registry.clear_override("notes"));
        assert_eq!(registry.resolver_for(&conflict("notes")).name(), "field_merge");
    }

    #[test]
    fn custom_default() {
        let registry = ResolverRegistry::default();
        registry.set_default(Arc::new(RemoteWinsResolver));
        assert_eq!(registry.resolve(&conflict("x")).action, ResolutionAction::UseRemote);
    }

    #[test]
    fn follows_history_suggestion_when_enabled() {
        let registry = ResolverRegistry::new(ResolverConfig::default().with_history_suggestions(true));
        let case = conflict("notes");
        let remote = RemoteWinsResolver.resolve(&case);
        for _ in 0..3 {
            registry.record_outcome(&case, &remote, ResolutionOutcome::Succeeded);
        }

        assert_eq!(registry.resolver_for(&conflict("notes")).name(), RemoteWinsResolver::NAME);
        assert_eq!(registry.resolver_for(&conflict("other")).name(), "field_merge");
        assert_eq!(registry.history().len(), 3);
    }
}
