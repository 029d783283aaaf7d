//! Value-shape classification.
//!
//! Merge strategies are picked from the runtime shape of the diverging
//! values, not from a static schema. Classifiers are evaluated in the order
//! of the `ValueShape` variants; the first match wins.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keys that identify an object inside a list.
pub(crate) const ID_KEYS: &[&str] = &["id", "_id", "uuid", "key"];

/// Keys that carry an object's timestamp.
pub(crate) const TIMESTAMP_KEYS: &[&str] = &[
    "updated_at",
    "updatedAt",
    "modified_at",
    "modifiedAt",
    "timestamp",
    "created_at",
    "createdAt",
    "time",
    "date",
];

/// Shape of a field value, in classifier priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueShape {
    /// Non-empty list of objects sharing an id-like key.
    KeyedObjectList,
    /// Non-empty list of objects that all carry a timestamp.
    TimestampedObjectList,
    /// Any other list.
    PlainList,
    /// Number.
    Number,
    /// RFC 3339 timestamp string.
    Timestamp,
    /// Any other string.
    Text,
    /// Boolean.
    Boolean,
    /// Nested object.
    NestedMap,
    /// Null, or values compared by equality only.
    Opaque,
}

/// Classifies a single value.
pub fn classify(value: &Value) -> ValueShape {
    match value {
        Value::Array(items) => {
            if id_key(items).is_some() {
                ValueShape::KeyedObjectList
            } else if is_timestamped_list(items) {
                ValueShape::TimestampedObjectList
            } else {
                ValueShape::PlainList
            }
        }
        Value::Number(_) => ValueShape::Number,
        Value::String(text) if parse_rfc3339(text).is_some() => ValueShape::Timestamp,
        Value::String(_) => ValueShape::Text,
        Value::Bool(_) => ValueShape::Boolean,
        Value::Object(_) => ValueShape::NestedMap,
        Value::Null => ValueShape::Opaque,
    }
}

/// Classifies a diverging pair. Mismatched shapes are opaque.
pub(crate) fn classify_pair(local: &Value, remote: &Value) -> ValueShape {
    let left = classify(local);
    let right = classify(remote);
    if left == right {
        return left;
    }
    // A list can look keyed on one side and plain on the other when one side is empty.
    match (left, right) {
        (ValueShape::PlainList, other) | (other, ValueShape::PlainList)
            if matches!(
                other,
                ValueShape::KeyedObjectList | ValueShape::TimestampedObjectList
            ) =>
        {
            ValueShape::PlainList
        }
        _ => ValueShape::Opaque,
    }
}

/// Classifies a diverging pair stored under `field`.
///
/// Integers under a timestamp-like field name are epoch milliseconds and
/// merge as timestamps rather than numbers.
pub(crate) fn classify_field(field: &str, local: &Value, remote: &Value) -> ValueShape {
    let shape = classify_pair(local, remote);
    if shape == ValueShape::Number && is_timestamp_field(field) && local.is_i64() && remote.is_i64() {
        return ValueShape::Timestamp;
    }
    shape
}

/// Returns true if `field` names a timestamp.
pub(crate) fn is_timestamp_field(field: &str) -> bool {
    TIMESTAMP_KEYS.contains(&field) || field.ends_with("_at") || field.ends_with("At")
}

/// Parses a timestamp from an RFC 3339 string or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_rfc3339(text),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Returns the timestamp carried by an object, if any.
pub(crate) fn object_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let object = value.as_object()?;
    TIMESTAMP_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(parse_timestamp))
}

/// Returns the id key shared by every object in `items`.
pub(crate) fn id_key(items: &[Value]) -> Option<&'static str> {
    if items.is_empty() {
        return None;
    }
    ID_KEYS.iter().copied().find(|key| {
        items.iter().all(|item| {
            item.as_object()
                .and_then(|object| object.get(*key))
                .is_some_and(|id| !id.is_null())
        })
    })
}

fn is_timestamped_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.is_object() && object_timestamp(item).is_some())
}

fn parse_rfc3339(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}
