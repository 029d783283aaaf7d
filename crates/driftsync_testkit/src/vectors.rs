//! Shared test vectors for delta encoding and field merging.

use driftsync_conflict::{ConflictCase, ResolverConfig, ResolverRegistry};
use driftsync_core::{apply_delta, calculate_delta, Payload};
use serde_json::{json, Value};

use crate::fixtures::payload;

/// A delta encoding vector.
#[derive(Debug, Clone)]
pub struct DeltaVector {
    /// Vector name.
    pub name: &'static str,
    /// Old payload.
    pub base: Value,
    /// New payload.
    pub target: Value,
    /// Fields the patch must carry, sorted.
    pub changed: Vec<&'static str>,
    /// Fields the patch must delete, sorted.
    pub deleted: Vec<&'static str>,
}

/// Standard delta vectors.
pub fn delta_vectors() -> Vec<DeltaVector> {
    vec![
        DeltaVector {
            name: "identical",
            base: json!({"a": 1, "b": "x"}),
            target: json!({"a": 1, "b": "x"}),
            changed: vec![],
            deleted: vec![],
        },
        DeltaVector {
            name: "single change",
            base: json!({"name": "A", "value": 1}),
            target: json!({"name": "A", "value": 2}),
            changed: vec!["value"],
            deleted: vec![],
        },
        DeltaVector {
            name: "add and remove",
            base: json!({"keep": true, "drop": 1}),
            target: json!({"keep": true, "new": [1, 2]}),
            changed: vec!["new"],
            deleted: vec!["drop"],
        },
        DeltaVector {
            name: "nested object replaced whole",
            base: json!({"address": {"city": "Arusha", "zip": "23100"}}),
            target: json!({"address": {"city": "Moshi", "zip": "23100"}}),
            changed: vec!["address"],
            deleted: vec![],
        },
        DeltaVector {
            name: "type change",
            base: json!({"count": "3"}),
            target: json!({"count": 3}),
            changed: vec!["count"],
            deleted: vec![],
        },
        DeltaVector {
            name: "null is a value",
            base: json!({"note": "x"}),
            target: json!({"note": null}),
            changed: vec!["note"],
            deleted: vec![],
        },
        DeltaVector {
            name: "from empty",
            base: json!({}),
            target: json!({"a": 1, "b": 2}),
            changed: vec!["a", "b"],
            deleted: vec![],
        },
        DeltaVector {
            name: "to empty",
            base: json!({"b": 2, "a": 1}),
            target: json!({}),
            changed: vec![],
            deleted: vec!["a", "b"],
        },
    ]
}

/// Checks a delta vector. Returns a description of the first mismatch.
pub fn verify_delta_vector(vector: &DeltaVector) -> Result<(), String> {
    let base = payload(vector.base.clone());
    let target = payload(vector.target.clone());
    let patch = calculate_delta(&base, &target);

    let mut changed: Vec<&str> = patch.changes.keys().map(String::as_str).collect();
    changed.sort_unstable();
    if changed != vector.changed {
        return Err(format!("{}: changed {:?}, expected {:?}", vector.name, changed, vector.changed));
    }
    let deleted: Vec<&str> = patch.deletions.iter().map(String::as_str).collect();
    if deleted != vector.deleted {
        return Err(format!("{}: deleted {:?}, expected {:?}", vector.name, deleted, vector.deleted));
    }

    let applied = apply_delta(&base, &patch, true).map_err(|err| format!("{}: {err}", vector.name))?;
    if applied != target {
        return Err(format!("{}: applied patch does not reproduce target", vector.name));
    }
    Ok(())
}

/// A three-way merge vector.
#[derive(Debug, Clone)]
pub struct MergeVector {
    /// Vector name.
    pub name: &'static str,
    /// Common ancestor.
    pub base: Value,
    /// Local version.
    pub local: Value,
    /// Remote version.
    pub remote: Value,
    /// Expected merge.
    pub merged: Value,
}

/// Merges that must resolve automatically with the default configuration.
pub fn merge_vectors() -> Vec<MergeVector> {
    vec![
        MergeVector {
            name: "disjoint edits",
            base: json!({"name": "A", "value": 1}),
            local: json!({"name": "A", "value": 2}),
            remote: json!({"name": "B", "value": 1}),
            merged: json!({"name": "B", "value": 2}),
        },
        MergeVector {
            name: "local addition",
            base: json!({"title": "t"}),
            local: json!({"title": "t", "tag": "home"}),
            remote: json!({"title": "t"}),
            merged: json!({"title": "t", "tag": "home"}),
        },
        MergeVector {
            name: "same edit on both sides",
            base: json!({"done": false}),
            local: json!({"done": true}),
            remote: json!({"done": true}),
            merged: json!({"done": true}),
        },
    ]
}

/// Checks a merge vector against the default field merge resolver.
pub fn verify_merge_vector(vector: &MergeVector) -> Result<(), String> {
    let registry = ResolverRegistry::new(ResolverConfig::default());
    let case = ConflictCase::new(
        "vectors",
        vector.name,
        Some(payload(vector.base.clone())),
        payload(vector.local.clone()),
        payload(vector.remote.clone()),
    );
    let resolution = registry.resolve(&case);
    if !resolution.is_auto_resolved() {
        return Err(format!("{}: deferred with confidence {}", vector.name, resolution.confidence));
    }
    let expected: Payload = payload(vector.merged.clone());
    if resolution.merged != expected {
        return Err(format!(
            "{}: merged {}, expected {}",
            vector.name,
            Value::Object(resolution.merged),
            vector.merged
        ));
    }
    Ok(())
}
