//! Property-based test generators using proptest.
//!
//! Payload strategies keep values JSON-representable: floats are finite and
//! nesting is shallow, so checksums and equality behave.

use driftsync_conflict::ConflictCase;
use driftsync_core::Payload;
use driftsync_queue::{OperationKind, Priority};
use driftsync_scheduler::{IntervalBounds, IntervalSignals, NetworkQuality, PowerState, SystemConditions};
use proptest::prelude::*;
use serde_json::{Number, Value};
use std::time::Duration;

/// Strategy for generating field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for generating record IDs.
pub fn record_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{1,8}").expect("Invalid regex")
}

/// Strategy for generating scalar JSON values.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1_000_000i64..1_000_000).prop_map(Value::from),
        (-1.0e6f64..1.0e6).prop_map(|f| Number::from_f64(f).map_or(Value::Null, Value::Number)),
        prop::string::string_regex("[ -~]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for generating JSON values up to three levels deep.
pub fn json_value_strategy() -> impl Strategy<Value = Value> {
    scalar_value_strategy().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(field_name_strategy(), inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

/// Strategy for generating record payloads.
pub fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map(field_name_strategy(), json_value_strategy(), 0..8)
        .prop_map(|map| map.into_iter().collect())
}

/// What happens to one field of a base payload.
#[derive(Debug, Clone)]
pub enum FieldEdit {
    /// Left as is.
    Keep,
    /// Replaced.
    Change(Value),
    /// Removed.
    Remove,
}

fn field_edit_strategy() -> impl Strategy<Value = FieldEdit> {
    prop_oneof![
        3 => Just(FieldEdit::Keep),
        2 => json_value_strategy().prop_map(FieldEdit::Change),
        1 => Just(FieldEdit::Remove),
    ]
}

/// Applies per-field edits to `base`, then adds fields from `additions`
/// that `base` lacks.
pub fn apply_edits(base: &Payload, edits: &[FieldEdit], additions: Payload) -> Payload {
    let mut edited = Payload::new();
    for ((key, value), edit) in base.iter().zip(edits) {
        match edit {
            FieldEdit::Keep => {
                edited.insert(key.clone(), value.clone());
            }
            FieldEdit::Change(value) => {
                edited.insert(key.clone(), value.clone());
            }
            FieldEdit::Remove => {}
        }
    }
    for (key, value) in additions {
        if !base.contains_key(&key) {
            edited.entry(key).or_insert(value);
        }
    }
    edited
}

/// Strategy for generating an edited copy of `base`.
pub fn edited_payload_strategy(base: Payload) -> impl Strategy<Value = Payload> {
    let len = base.len();
    (
        prop::collection::vec(field_edit_strategy(), len),
        prop::collection::btree_map(field_name_strategy(), scalar_value_strategy(), 0..3),
    )
        .prop_map(move |(edits, additions)| apply_edits(&base, &edits, additions.into_iter().collect()))
}

/// Strategy for generating a payload and an edited version of it.
pub fn payload_pair_strategy() -> impl Strategy<Value = (Payload, Payload)> {
    payload_strategy().prop_flat_map(|base| {
        let edited = edited_payload_strategy(base.clone());
        (Just(base), edited)
    })
}

/// Strategy for generating `(base, local, remote)` triples with
/// independent edits on each side.
pub fn conflict_triple_strategy() -> impl Strategy<Value = (Payload, Payload, Payload)> {
    payload_strategy().prop_flat_map(|base| {
        let local = edited_payload_strategy(base.clone());
        let remote = edited_payload_strategy(base.clone());
        (Just(base), local, remote)
    })
}

/// Strategy for generating conflict cases.
pub fn conflict_case_strategy() -> impl Strategy<Value = ConflictCase> {
    conflict_triple_strategy()
        .prop_map(|(base, local, remote)| ConflictCase::new("items", "r1", Some(base), local, remote))
}

/// Strategy for generating priorities.
pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Critical),
        Just(Priority::High),
        Just(Priority::Normal),
        Just(Priority::Low),
    ]
}

/// Strategy for generating operation kinds.
pub fn operation_kind_strategy() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Create),
        Just(OperationKind::Update),
        Just(OperationKind::Delete),
    ]
}

/// Strategy for generating device conditions.
pub fn conditions_strategy() -> impl Strategy<Value = SystemConditions> {
    let network = prop_oneof![
        Just(NetworkQuality::Offline),
        Just(NetworkQuality::Poor),
        Just(NetworkQuality::Fair),
        Just(NetworkQuality::Good),
        Just(NetworkQuality::Excellent),
    ];
    let power = prop_oneof![
        Just(PowerState::Critical),
        Just(PowerState::Low),
        Just(PowerState::Normal),
        Just(PowerState::Charging),
    ];
    (network, power).prop_map(|(network, power)| SystemConditions::new(network, power))
}

/// Strategy for generating usage and reliability signals, including
/// extreme change rates.
pub fn signals_strategy() -> impl Strategy<Value = IntervalSignals> {
    let rate = prop_oneof![
        4 => 0.0f64..100.0,
        1 => 100.0f64..1.0e9,
    ];
    (rate, prop::option::of(0.0f64..=1.0)).prop_map(|(changes_per_hour, success_rate)| IntervalSignals {
        changes_per_hour,
        success_rate,
    })
}

/// Strategy for generating interval bounds, possibly unordered.
pub fn bounds_strategy() -> impl Strategy<Value = IntervalBounds> {
    (1u64..600_000, 1u64..600_000, 1u64..86_400_000).prop_map(|(base, min, max)| {
        IntervalBounds::new(
            Duration::from_millis(base),
            Duration::from_millis(min),
            Duration::from_millis(max),
        )
    })
}
