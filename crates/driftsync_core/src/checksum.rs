//! Canonical serialization and payload checksums.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::record::Payload;

/// SHA-256 digest of a canonicalized payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Computes the checksum of any JSON value.
    pub fn of(value: &Value) -> Self {
        let digest = Sha256::digest(canonical_bytes(value));
        Self(digest.into())
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a hex representation.
    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes = hex::decode(text).ok()?;
        <[u8; 32]>::try_from(bytes.as_slice()).ok().map(Self)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..12])
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Checksum::from_hex(&text)
            .ok_or_else(|| serde::de::Error::custom("checksum must be 64 hex characters"))
    }
}

/// Computes the checksum of a payload.
pub fn checksum(payload: &Payload) -> Checksum {
    let mut out = Vec::new();
    write_object(payload, &mut out);
    Checksum::from_bytes(Sha256::digest(&out).into())
}

/// Serializes a value with object keys sorted recursively.
///
/// The output is compact JSON, so it is stable across map
/// implementations and insertion orders.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => write_object(map, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

fn write_object(map: &Payload, out: &mut Vec<u8>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push(b'{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(Value::String(key.clone()).to_string().as_bytes());
        out.push(b':');
        write_value(&map[key.as_str()], out);
    }
    out.push(b'}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn canonical_bytes_sort_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [3, {"d": 1, "c": 2}]}});
        let bytes = canonical_bytes(&value);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"y":[3,{"c":2,"d":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn checksum_independent_of_insertion_order() {
        let mut first = Payload::new();
        first.insert("name".into(), json!("A"));
        first.insert("value".into(), json!(1));

        let mut second = Payload::new();
        second.insert("value".into(), json!(1));
        second.insert("name".into(), json!("A"));

        assert_eq!(checksum(&first), checksum(&second));
    }

    #[test]
    fn checksum_distinguishes_values() {
        let a = payload(json!({"value": 1}));
        let b = payload(json!({"value": 2}));
        assert_ne!(checksum(&a), checksum(&b));
    }

    #[test]
    fn payload_checksum_matches_value_checksum() {
        let p = payload(json!({"k": [1, 2], "n": null}));
        assert_eq!(checksum(&p), Checksum::of(&Value::Object(p.clone())));
    }

    #[test]
    fn hex_roundtrip_and_serde() {
        let sum = checksum(&payload(json!({"x": "y"})));
        assert_eq!(Checksum::from_hex(&sum.to_hex()), Some(sum));
        assert_eq!(Checksum::from_hex("zz"), None);

        let encoded = serde_json::to_string(&sum).unwrap();
        let decoded: Checksum = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, sum);
    }
}
