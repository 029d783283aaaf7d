//! Merge strategies, dispatched on value shape.

use driftsync_core::{canonical_bytes, Payload};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::{HashMap, HashSet};

use crate::case::{diverging_fields, FieldChange, FieldConflict};
use crate::config::{BooleanPolicy, NumericPolicy, ResolverConfig};
use crate::resolution::{FieldResolution, Provenance};
use crate::shape::{classify_field, id_key, object_timestamp, parse_timestamp, ValueShape, TIMESTAMP_KEYS};

/// Strategy used to resolve one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Only the local side changed the field.
    LocalChange,
    /// Only the remote side changed the field.
    RemoteChange,
    /// Id-keyed object lists merged by id.
    KeyedList,
    /// Timestamped object lists merged by recency.
    RecencyList,
    /// Three-way set union of plain lists.
    ListUnion,
    /// Numeric policy.
    Numeric,
    /// Longer or remote text.
    Text,
    /// Boolean policy.
    Boolean,
    /// Recursive merge of nested objects.
    DeepMerge,
    /// Chronologically later timestamp.
    LatestTimestamp,
    /// Side with the later record-level timestamp.
    LatestRecord,
    /// Fixed resolver policy (local, remote, last-write-wins, manual).
    FixedPolicy,
}

/// Result of merging one field.
#[derive(Debug, Clone)]
pub(crate) struct FieldMerge {
    pub value: Option<Value>,
    pub confidence: f64,
    pub strategy: MergeStrategy,
    pub provenance: Provenance,
}

/// Shared inputs of a merge.
pub(crate) struct MergeContext<'a> {
    pub config: &'a ResolverConfig,
    pub local_record: &'a Payload,
    pub remote_record: &'a Payload,
}

/// Three-way merge of two objects.
///
/// Every diverging leaf is appended to `out`; nested objects contribute
/// their children with dotted paths instead of a single entry.
pub(crate) fn merge_payloads(
    ctx: &MergeContext<'_>,
    prefix: &str,
    base: Option<&Payload>,
    local: &Payload,
    remote: &Payload,
    out: &mut Vec<FieldResolution>,
) -> Payload {
    let mut merged = local.clone();

    for field in diverging_fields(base, local, remote) {
        let path = if prefix.is_empty() {
            field.field.clone()
        } else {
            format!("{prefix}.{}", field.field)
        };

        let result = match field.change {
            FieldChange::LocalOnly => FieldMerge {
                value: field.local.clone(),
                confidence: 1.0,
                strategy: MergeStrategy::LocalChange,
                provenance: Provenance::Local,
            },
            FieldChange::RemoteOnly => FieldMerge {
                value: field.remote.clone(),
                confidence: 1.0,
                strategy: MergeStrategy::RemoteChange,
                provenance: Provenance::Remote,
            },
            FieldChange::Both => merge_field(ctx, &path, &field, out),
        };

        if result.strategy != MergeStrategy::DeepMerge {
            out.push(FieldResolution {
                path,
                strategy: result.strategy,
                provenance: result.provenance,
                confidence: result.confidence,
            });
        }

        match result.value {
            Some(value) => {
                merged.insert(field.field, value);
            }
            None => {
                merged.remove(&field.field);
            }
        }
    }

    merged
}

fn merge_field(
    ctx: &MergeContext<'_>,
    path: &str,
    field: &FieldConflict,
    out: &mut Vec<FieldResolution>,
) -> FieldMerge {
    let (Some(local), Some(remote)) = (&field.local, &field.remote) else {
        return latest_record(ctx, field);
    };
    let confidence = &ctx.config.strategy_confidence;
    let base = field.base.as_ref();

    match classify_field(leaf(path), local, remote) {
        ValueShape::KeyedObjectList => {
            let (l, r) = (as_list(local), as_list(remote));
            match id_key(l).filter(|key| id_key(r) == Some(*key)) {
                Some(key) => {
                    let merged = merge_keyed_lists(base.and_then(Value::as_array), l, r, key);
                    list_result(merged, local, remote, confidence.keyed_list, MergeStrategy::KeyedList)
                }
                None => {
                    let merged = union_lists(base.and_then(Value::as_array), l, r);
                    list_result(merged, local, remote, confidence.list_union, MergeStrategy::ListUnion)
                }
            }
        }
        ValueShape::TimestampedObjectList => {
            let merged = merge_by_recency(base.and_then(Value::as_array), as_list(local), as_list(remote));
            list_result(merged, local, remote, confidence.recency_list, MergeStrategy::RecencyList)
        }
        ValueShape::PlainList => {
            let merged = union_lists(base.and_then(Value::as_array), as_list(local), as_list(remote));
            list_result(merged, local, remote, confidence.list_union, MergeStrategy::ListUnion)
        }
        ValueShape::Number => {
            let policy = ctx.config.numeric_policy_for(leaf(path));
            let (value, provenance) = merge_numbers(local, remote, policy);
            FieldMerge {
                value: Some(value),
                confidence: confidence.numeric,
                strategy: MergeStrategy::Numeric,
                provenance,
            }
        }
        ValueShape::Timestamp => {
            let local_at = parse_timestamp(local);
            let remote_at = parse_timestamp(remote);
            let (value, provenance) = if local_at > remote_at {
                (local.clone(), Provenance::Local)
            } else {
                (remote.clone(), Provenance::Remote)
            };
            FieldMerge {
                value: Some(value),
                confidence: confidence.timestamp,
                strategy: MergeStrategy::LatestTimestamp,
                provenance,
            }
        }
        ValueShape::Text => {
            let l = local.as_str().unwrap_or_default();
            let r = remote.as_str().unwrap_or_default();
            let similarity = text_similarity(l, r);
            let (value, provenance, score) = if similarity >= ctx.config.text_similarity_threshold {
                (remote.clone(), Provenance::Remote, confidence.text_similar)
            } else if l.chars().count() > r.chars().count() {
                (local.clone(), Provenance::Local, confidence.text_divergent)
            } else {
                (remote.clone(), Provenance::Remote, confidence.text_divergent)
            };
            FieldMerge {
                value: Some(value),
                confidence: score,
                strategy: MergeStrategy::Text,
                provenance,
            }
        }
        ValueShape::Boolean => {
            let l = local.as_bool().unwrap_or_default();
            let r = remote.as_bool().unwrap_or_default();
            let merged = match ctx.config.boolean_policy_for(leaf(path)) {
                BooleanPolicy::Or => l || r,
                BooleanPolicy::And => l && r,
                BooleanPolicy::PreferLocal => l,
                BooleanPolicy::PreferRemote => r,
            };
            FieldMerge {
                value: Some(Value::Bool(merged)),
                confidence: confidence.boolean,
                strategy: MergeStrategy::Boolean,
                provenance: if merged == l {
                    Provenance::Local
                } else {
                    Provenance::Remote
                },
            }
        }
        ValueShape::NestedMap => {
            let empty = Payload::new();
            let l = local.as_object().unwrap_or(&empty);
            let r = remote.as_object().unwrap_or(&empty);
            let first_child = out.len();
            let merged = merge_payloads(ctx, path, base.and_then(Value::as_object), l, r, out);
            let child_confidence = out[first_child..]
                .iter()
                .map(|f| f.confidence)
                .fold(1.0, f64::min);
            FieldMerge {
                value: Some(Value::Object(merged)),
                confidence: child_confidence,
                strategy: MergeStrategy::DeepMerge,
                provenance: Provenance::Merged,
            }
        }
        ValueShape::Opaque => latest_record(ctx, field),
    }
}

/// Record-level latest-timestamp fallback. Prefers remote when neither
/// side carries a timestamp.
fn latest_record(ctx: &MergeContext<'_>, field: &FieldConflict) -> FieldMerge {
    let local_at = record_timestamp(ctx.local_record);
    let remote_at = record_timestamp(ctx.remote_record);
    let local_wins = matches!((local_at, remote_at), (Some(l), Some(r)) if l > r)
        || (local_at.is_some() && remote_at.is_none());

    let (value, provenance) = if local_wins {
        (field.local.clone(), Provenance::Local)
    } else {
        (field.remote.clone(), Provenance::Remote)
    };
    FieldMerge {
        value,
        confidence: ctx.config.strategy_confidence.fallback,
        strategy: MergeStrategy::LatestRecord,
        provenance,
    }
}

/// Record-level modification timestamp of a payload.
pub(crate) fn record_timestamp(payload: &Payload) -> Option<chrono::DateTime<chrono::Utc>> {
    TIMESTAMP_KEYS
        .iter()
        .find_map(|key| payload.get(*key).and_then(parse_timestamp))
}

fn list_result(
    merged: Vec<Value>,
    local: &Value,
    remote: &Value,
    confidence: f64,
    strategy: MergeStrategy,
) -> FieldMerge {
    let provenance = if as_list(local) == merged.as_slice() {
        Provenance::Local
    } else if as_list(remote) == merged.as_slice() {
        Provenance::Remote
    } else {
        Provenance::Merged
    };
    FieldMerge {
        value: Some(Value::Array(merged)),
        confidence,
        strategy,
        provenance,
    }
}

fn as_list(value: &Value) -> &[Value] {
    value.as_array().map(Vec::as_slice).unwrap_or_default()
}

fn leaf(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

fn identity(value: &Value) -> String {
    String::from_utf8_lossy(&canonical_bytes(value)).into_owned()
}

/// Picks the newer of two versions of the same keyed entry.
fn newer<'a>(local: &'a Value, remote: &'a Value, base: Option<&Value>) -> &'a Value {
    match (object_timestamp(local), object_timestamp(remote)) {
        (Some(l), Some(r)) => {
            if r > l {
                remote
            } else {
                local
            }
        }
        _ if base == Some(local) => remote,
        _ => local,
    }
}

/// Indexes a keyed list, keeping the newest entry per key.
fn index_keyed<'a>(items: &'a [Value], key: &str) -> (Vec<String>, HashMap<String, &'a Value>) {
    let mut order = Vec::new();
    let mut index: HashMap<String, &Value> = HashMap::new();
    for item in items {
        let Some(id) = item.get(key) else { continue };
        let id = identity(id);
        match index.get(&id).copied() {
            Some(existing) => {
                let keep = newer(existing, item, None);
                index.insert(id, keep);
            }
            None => {
                order.push(id.clone());
                index.insert(id, item);
            }
        }
    }
    (order, index)
}

/// Merges id-keyed lists into a fresh list.
///
/// Order follows local first, then remote-only entries. An entry deleted
/// on one side stays deleted unless the other side modified it.
fn merge_keyed_lists(base: Option<&Vec<Value>>, local: &[Value], remote: &[Value], key: &str) -> Vec<Value> {
    let (_, base_index) = index_keyed(base.map(Vec::as_slice).unwrap_or_default(), key);
    let (local_order, local_index) = index_keyed(local, key);
    let (remote_order, remote_index) = index_keyed(remote, key);

    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for id in local_order.iter().chain(remote_order.iter()) {
        if !seen.insert(id.as_str()) {
            continue;
        }
        let base_entry = base_index.get(id).copied();
        let entry = match (local_index.get(id), remote_index.get(id)) {
            (Some(l), Some(r)) if l == r => Some(*l),
            (Some(l), Some(r)) => Some(newer(l, r, base_entry)),
            (Some(l), None) if base_entry != Some(*l) => Some(*l),
            (None, Some(r)) if base_entry != Some(*r) => Some(*r),
            _ => None,
        };
        if let Some(entry) = entry {
            merged.push(entry.clone());
        }
    }
    merged
}

/// Three-way set union: items removed by either side relative to the
/// base are dropped, everything else is kept once, local order first.
fn union_lists(base: Option<&Vec<Value>>, local: &[Value], remote: &[Value]) -> Vec<Value> {
    let local_ids: HashSet<String> = local.iter().map(identity).collect();
    let remote_ids: HashSet<String> = remote.iter().map(identity).collect();
    let removed: HashSet<String> = base
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(identity)
        .filter(|id| !local_ids.contains(id) || !remote_ids.contains(id))
        .collect();

    let mut seen = HashSet::new();
    local
        .iter()
        .chain(remote.iter())
        .filter(|item| {
            let id = identity(item);
            !removed.contains(&id) && seen.insert(id)
        })
        .cloned()
        .collect()
}

/// Union of timestamped entries, ordered oldest first.
fn merge_by_recency(base: Option<&Vec<Value>>, local: &[Value], remote: &[Value]) -> Vec<Value> {
    let mut merged = union_lists(base, local, remote);
    merged.sort_by_key(object_timestamp);
    merged
}

fn merge_numbers(local: &Value, remote: &Value, policy: NumericPolicy) -> (Value, Provenance) {
    let l = local.as_f64().unwrap_or_default();
    let r = remote.as_f64().unwrap_or_default();
    let pick = |take_remote: bool| {
        if take_remote {
            (remote.clone(), Provenance::Remote)
        } else {
            (local.clone(), Provenance::Local)
        }
    };

    match policy {
        NumericPolicy::Max => pick(r > l),
        NumericPolicy::Min => pick(r < l),
        NumericPolicy::PreferLarger => pick(r.abs() > l.abs()),
        NumericPolicy::Average => {
            if let (Some(a), Some(b)) = (local.as_i64(), remote.as_i64()) {
                let sum = i128::from(a) + i128::from(b);
                if sum % 2 == 0 {
                    // The midpoint of two i64 values always fits in i64.
                    return (Value::from((sum / 2) as i64), Provenance::Merged);
                }
            }
            match Number::from_f64((l + r) / 2.0) {
                Some(mean) => (Value::Number(mean), Provenance::Merged),
                None => pick(false),
            }
        }
    }
}

/// Dice coefficient over lowercase character bigrams, in `[0, 1]`.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a == b {
        return 1.0;
    }
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }

    let mut bigrams: HashMap<(char, char), usize> = HashMap::new();
    for pair in a.windows(2) {
        *bigrams.entry((pair[0], pair[1])).or_insert(0) += 1;
    }

    let mut shared = 0usize;
    for pair in b.windows(2) {
        if let Some(count) = bigrams.get_mut(&(pair[0], pair[1])) {
            if *count > 0 {
                *count -= 1;
                shared += 1;
            }
        }
    }

    2.0 * shared as f64 / (a.len() - 1 + b.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn merge(config: &ResolverConfig, base: Option<Value>, local: Value, remote: Value) -> (Payload, Vec<FieldResolution>) {
        let base = base.map(payload);
        let local = payload(local);
        let remote = payload(remote);
        let ctx = MergeContext {
            config,
            local_record: &local,
            remote_record: &remote,
        };
        let mut out = Vec::new();
        let merged = merge_payloads(&ctx, "", base.as_ref(), &local, &remote, &mut out);
        (merged, out)
    }

    #[test]
    fn keyed_lists_merge_by_id_preferring_newer() {
        let config = ResolverConfig::default();
        let (merged, fields) = merge(
            &config,
            Some(json!({"items": [{"id": 1, "v": "a", "updated_at": "2024-01-01T00:00:00Z"}]})),
            json!({"items": [
                {"id": 1, "v": "local", "updated_at": "2024-01-03T00:00:00Z"},
                {"id": 2, "v": "new-local"}
            ]}),
            json!({"items": [
                {"id": 1, "v": "remote", "updated_at": "2024-01-02T00:00:00Z"},
                {"id": 3, "v": "new-remote"}
            ]}),
        );

        let ids: Vec<i64> = merged["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(merged["items"][0]["v"], json!("local"));
        assert_eq!(fields[0].strategy, MergeStrategy::KeyedList);
        assert_eq!(fields[0].provenance, Provenance::Merged);
    }

    #[test]
    fn keyed_list_honours_deletions() {
        let config = ResolverConfig::default();
        let (merged, _) = merge(
            &config,
            Some(json!({"items": [{"id": 1}, {"id": 2}]})),
            json!({"items": [{"id": 1}, {"id": 3}]}),
            json!({"items": [{"id": 1}, {"id": 2}, {"id": 4}]}),
        );
        assert_eq!(merged["items"], json!([{"id": 1}, {"id": 3}, {"id": 4}]));
    }

    #[test]
    fn plain_lists_union_without_duplicates() {
        let config = ResolverConfig::default();
        let (merged, fields) = merge(
            &config,
            Some(json!({"tags": ["a", "b"]})),
            json!({"tags": ["a", "b", "c"]}),
            json!({"tags": ["b", "d"]}),
        );
        assert_eq!(merged["tags"], json!(["b", "c", "d"]));
        assert_eq!(fields[0].strategy, MergeStrategy::ListUnion);
    }

    #[test]
    fn timestamped_lists_sorted_by_recency() {
        let config = ResolverConfig::default();
        let (merged, fields) = merge(
            &config,
            None,
            json!({"log": [{"at": 0, "time": "2024-01-03T00:00:00Z"}]}),
            json!({"log": [{"at": 1, "time": "2024-01-01T00:00:00Z"}]}),
        );
        assert_eq!(merged["log"][0]["at"], json!(1));
        assert_eq!(merged["log"][1]["at"], json!(0));
        assert_eq!(fields[0].strategy, MergeStrategy::RecencyList);
    }

    #[test]
    fn numeric_policies() {
        let (one, two) = (json!(1), json!(4));
        assert_eq!(merge_numbers(&one, &two, NumericPolicy::Max).0, json!(4));
        assert_eq!(merge_numbers(&one, &two, NumericPolicy::Min).0, json!(1));
        assert_eq!(merge_numbers(&json!(2), &two, NumericPolicy::Average).0, json!(3));
        assert_eq!(merge_numbers(&one, &two, NumericPolicy::Average).0, json!(2.5));
        assert_eq!(
            merge_numbers(&json!(-10), &two, NumericPolicy::PreferLarger).0,
            json!(-10)
        );
    }

    #[test]
    fn average_of_extreme_integers_does_not_overflow() {
        let max = json!(i64::MAX);
        let (merged, provenance) = merge_numbers(&max, &max, NumericPolicy::Average);
        assert_eq!(merged, json!(i64::MAX));
        assert_eq!(provenance, Provenance::Merged);

        let (merged, provenance) = merge_numbers(&max, &json!(i64::MAX - 1), NumericPolicy::Average);
        assert_eq!(provenance, Provenance::Merged);
        let mean = merged.as_f64().unwrap();
        assert!(mean > 9.0e18, "{mean}");

        let min = json!(i64::MIN);
        assert_eq!(merge_numbers(&min, &min, NumericPolicy::Average).0, json!(i64::MIN));
        let mean = merge_numbers(&min, &max, NumericPolicy::Average).0.as_f64().unwrap();
        assert!(mean.abs() < 1.0, "{mean}");
    }

    #[test]
    fn numeric_field_override_applies_to_leaf() {
        let config = ResolverConfig::default().with_numeric_field("stock", NumericPolicy::Min);
        let (merged, _) = merge(
            &config,
            None,
            json!({"item": {"stock": 3}}),
            json!({"item": {"stock": 7}}),
        );
        assert_eq!(merged["item"]["stock"], json!(3));
    }

    #[test]
    fn epoch_millis_timestamps_keep_the_later_value() {
        let config = ResolverConfig::default().with_numeric_policy(NumericPolicy::Min);
        let (merged, fields) = merge(
            &config,
            None,
            json!({"meta": {"updated_at": 1_700_000_000_000i64}, "score": 9}),
            json!({"meta": {"updated_at": 1_700_000_900_000i64}, "score": 4}),
        );
        assert_eq!(merged["meta"]["updated_at"], json!(1_700_000_900_000i64));
        assert_eq!(merged["score"], json!(4));
        let stamp = fields.iter().find(|f| f.path == "meta.updated_at").unwrap();
        assert_eq!(stamp.strategy, MergeStrategy::LatestTimestamp);
    }

    #[test]
    fn text_prefers_longer_unless_similar() {
        let config = ResolverConfig::default();
        let (merged, fields) = merge(
            &config,
            None,
            json!({"body": "a much longer and more detailed description"}),
            json!({"body": "short"}),
        );
        assert_eq!(merged["body"], json!("a much longer and more detailed description"));
        assert_eq!(fields[0].provenance, Provenance::Local);

        let (merged, fields) = merge(
            &config,
            None,
            json!({"title": "Quarterly planning notes"}),
            json!({"title": "Quarterly planning notes!"}),
        );
        assert_eq!(merged["title"], json!("Quarterly planning notes!"));
        assert_eq!(fields[0].confidence, config.strategy_confidence.text_similar);
    }

    #[test]
    fn booleans_default_to_or() {
        let config = ResolverConfig::default();
        let (merged, _) = merge(&config, None, json!({"enabled": false}), json!({"enabled": true}));
        assert_eq!(merged["enabled"], json!(true));

        let config = config.with_boolean_field("enabled", BooleanPolicy::And);
        let (merged, _) = merge(&config, None, json!({"enabled": false}), json!({"enabled": true}));
        assert_eq!(merged["enabled"], json!(false));
    }

    #[test]
    fn nested_objects_merge_recursively() {
        let config = ResolverConfig::default();
        let (merged, fields) = merge(
            &config,
            Some(json!({"settings": {"theme": "light", "size": 1}})),
            json!({"settings": {"theme": "dark", "size": 1}}),
            json!({"settings": {"theme": "light", "size": 2}}),
        );
        assert_eq!(merged["settings"], json!({"theme": "dark", "size": 2}));
        let paths: Vec<&str> = fields.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["settings.size", "settings.theme"]);
    }

    #[test]
    fn timestamps_take_later() {
        let config = ResolverConfig::default();
        let (merged, fields) = merge(
            &config,
            None,
            json!({"due": "2024-03-01T00:00:00Z"}),
            json!({"due": "2024-02-01T00:00:00Z"}),
        );
        assert_eq!(merged["due"], json!("2024-03-01T00:00:00Z"));
        assert_eq!(fields[0].strategy, MergeStrategy::LatestTimestamp);
    }

    #[test]
    fn opaque_values_fall_back_to_latest_record() {
        let config = ResolverConfig::default();
        let (merged, fields) = merge(
            &config,
            None,
            json!({"x": 1, "updated_at": "2024-01-05T00:00:00Z"}),
            json!({"x": "one", "updated_at": "2024-01-01T00:00:00Z"}),
        );
        assert_eq!(merged["x"], json!(1));
        let x = fields.iter().find(|f| f.path == "x").unwrap();
        assert_eq!(x.strategy, MergeStrategy::LatestRecord);
        assert_eq!(x.confidence, config.strategy_confidence.fallback);
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(text_similarity("same", "same"), 1.0);
        assert_eq!(text_similarity("a", "b"), 0.0);
        let s = text_similarity("night", "nacht");
        assert!(s > 0.0 && s < 1.0);
    }
}
