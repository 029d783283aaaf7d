//! Benchmark utilities.

#![warn(missing_docs)]

use driftsync_core::Payload;
use rand::Rng;
use serde_json::Value;

/// Generate a payload with `fields` random scalar fields.
pub fn random_payload(fields: usize) -> Payload {
    let mut rng = rand::thread_rng();
    (0..fields)
        .map(|i| {
            let value = match i % 3 {
                0 => Value::from(rng.gen_range(0..1_000_000i64)),
                1 => Value::Bool(rng.gen()),
                _ => Value::String(random_text(&mut rng, 16)),
            };
            (format!("field_{:03}", i), value)
        })
        .collect()
}

/// Copy `base` with roughly `fraction` of its fields changed.
pub fn edit_payload(base: &Payload, fraction: f64) -> Payload {
    let mut rng = rand::thread_rng();
    base.iter()
        .map(|(key, value)| {
            if rng.gen_bool(fraction.clamp(0.0, 1.0)) {
                (key.clone(), Value::String(random_text(&mut rng, 16)))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

/// Copy `base` with every field whose index is `offset` modulo `stride` changed.
pub fn edit_every(base: &Payload, stride: usize, offset: usize) -> Payload {
    base.iter()
        .enumerate()
        .map(|(i, (key, value))| {
            if stride > 0 && i % stride == offset {
                (key.clone(), Value::String(format!("edited_{i}")))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

fn random_text(rng: &mut impl Rng, len: usize) -> String {
    (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}
