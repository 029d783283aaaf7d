//! The syncable record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checksum::{checksum, Checksum};
use crate::error::{CoreError, CoreResult};

/// Field map of a record.
pub type Payload = serde_json::Map<String, Value>;

/// Converts a JSON value into a payload.
///
/// Only objects are payloads; any other value is rejected as malformed.
pub fn payload_from_value(value: Value) -> CoreResult<Payload> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CoreError::MalformedPayload(format!(
            "expected a JSON object, found {}",
            value_kind(&other)
        ))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Stable, globally unique record identifier.
pub type RecordId = String;

/// One syncable application entity instance.
///
/// Records are owned by the local replica. The sync core receives and
/// returns them by value and never persists them itself.
///
/// # Invariants
///
/// - `sync_version` increases by exactly one per confirmed remote write
/// - When `dirty` is false, `fields` equal the last confirmed remote state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record ID.
    pub id: RecordId,
    /// Owning scope (tenant, workspace, user).
    pub scope_id: Option<String>,
    /// Field map.
    pub fields: Payload,
    /// Whether local changes are pending.
    pub dirty: bool,
    /// Time of the last confirmed remote write.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Number of confirmed remote writes.
    pub sync_version: u64,
    /// Soft-delete flag.
    pub deleted: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last local modification time.
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Creates a new dirty record that has never been synced.
    pub fn new(id: impl Into<RecordId>, fields: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            scope_id: None,
            fields,
            dirty: true,
            last_synced_at: None,
            sync_version: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the owning scope.
    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Replaces the field map with a local edit.
    pub fn apply_local_edit(&mut self, fields: Payload) {
        if fields != self.fields {
            self.fields = fields;
            self.dirty = true;
            self.updated_at = Utc::now();
        }
    }

    /// Sets a single field as a local edit.
    pub fn set_field(&mut self, key: impl Into<String>, value: Value) {
        let mut fields = self.fields.clone();
        fields.insert(key.into(), value);
        self.apply_local_edit(fields);
    }

    /// Soft-deletes the record locally.
    pub fn mark_deleted(&mut self) {
        if !self.deleted {
            self.deleted = true;
            self.dirty = true;
            self.updated_at = Utc::now();
        }
    }

    /// Records a confirmed remote write of `confirmed`.
    ///
    /// The record stays dirty if local edits landed after the confirmed
    /// payload was sent.
    pub fn mark_synced(&mut self, confirmed: &Payload, at: DateTime<Utc>) {
        self.sync_version += 1;
        self.last_synced_at = Some(at);
        self.dirty = self.fields != *confirmed;
    }

    /// Returns true if the record was confirmed remotely at least once.
    pub fn has_synced(&self) -> bool {
        self.sync_version > 0
    }

    /// Checksum of the current field map.
    pub fn checksum(&self) -> Checksum {
        checksum(&self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn new_record_is_dirty_and_unsynced() {
        let record = Record::new("r1", fields(json!({"name": "A"}))).with_scope("team-1");
        assert!(record.dirty);
        assert!(!record.has_synced());
        assert_eq!(record.sync_version, 0);
        assert_eq!(record.scope_id.as_deref(), Some("team-1"));
    }

    #[test]
    fn mark_synced_bumps_version_by_one() {
        let mut record = Record::new("r1", fields(json!({"name": "A"})));
        let confirmed = record.fields.clone();

        record.mark_synced(&confirmed, Utc::now());
        assert_eq!(record.sync_version, 1);
        assert!(!record.dirty);

        record.mark_synced(&confirmed, Utc::now());
        assert_eq!(record.sync_version, 2);
    }

    #[test]
    fn edits_after_send_keep_record_dirty() {
        let mut record = Record::new("r1", fields(json!({"value": 1})));
        let sent = record.fields.clone();
        record.set_field("value", json!(2));

        record.mark_synced(&sent, Utc::now());
        assert!(record.dirty);
        assert_eq!(record.sync_version, 1);
    }

    #[test]
    fn identical_edit_does_not_dirty() {
        let mut record = Record::new("r1", fields(json!({"value": 1})));
        let confirmed = record.fields.clone();
        record.mark_synced(&confirmed, Utc::now());

        record.apply_local_edit(confirmed);
        assert!(!record.dirty);
    }

    #[test]
    fn payload_from_value_accepts_only_objects() {
        assert_eq!(payload_from_value(json!({"a": 1})).unwrap().len(), 1);

        let err = payload_from_value(json!([1, 2])).unwrap_err();
        assert!(matches!(err, CoreError::MalformedPayload(_)));
        assert!(!err.is_checksum_mismatch());
        assert_eq!(err.to_string(), "malformed payload: expected a JSON object, found an array");

        let err = payload_from_value(json!("text")).unwrap_err();
        assert!(err.to_string().contains("a string"));
    }

    #[test]
    fn soft_delete() {
        let mut record = Record::new("r1", Payload::new());
        record.dirty = false;
        record.mark_deleted();
        assert!(record.deleted);
        assert!(record.dirty);
    }
}
