//! Local replica contract and an in-memory implementation.

use chrono::{DateTime, Utc};
use driftsync_core::{Payload, Record, RecordId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{SyncError, SyncResult};

/// Last remote state the replica knows a record to have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedSnapshot {
    /// Confirmed payload.
    pub payload: Payload,
    /// Remote version of that payload.
    pub remote_version: u64,
    /// When it was confirmed.
    pub synced_at: DateTime<Utc>,
}

/// Storage for records, provided by the application.
///
/// Besides the records themselves the replica keeps, per record, the last
/// remote state it saw. That snapshot is the base for delta encoding and
/// three-way merges.
pub trait LocalReplica: Send + Sync {
    /// Reads a record.
    fn read(&self, collection: &str, id: &str) -> SyncResult<Option<Record>>;

    /// Inserts or replaces a record.
    fn write(&self, collection: &str, record: Record) -> SyncResult<()>;

    /// Lists every record of a collection.
    fn list(&self, collection: &str) -> SyncResult<Vec<Record>>;

    /// Lists records with pending local changes.
    fn list_dirty(&self, collection: &str) -> SyncResult<Vec<Record>> {
        Ok(self
            .list(collection)?
            .into_iter()
            .filter(|record| record.dirty)
            .collect())
    }

    /// Last known remote state of a record.
    fn last_synced(&self, collection: &str, id: &str) -> SyncResult<Option<SyncedSnapshot>>;

    /// Records that the backend accepted `sent` and now holds `confirmed`.
    ///
    /// If the record was not edited since `sent` was taken, it adopts the
    /// confirmed payload. Otherwise it stays dirty with the newer edits.
    fn mark_synced(
        &self,
        collection: &str,
        id: &str,
        sent: &Payload,
        confirmed: &Payload,
        remote_version: u64,
        at: DateTime<Utc>,
    ) -> SyncResult<()>;

    /// Updates the remote snapshot only, leaving the record untouched.
    fn record_remote(&self, collection: &str, id: &str, snapshot: SyncedSnapshot) -> SyncResult<()>;

    /// Overwrites the record with remote state and marks it clean.
    fn apply_remote(
        &self,
        collection: &str,
        id: &str,
        payload: Payload,
        remote_version: u64,
        at: DateTime<Utc>,
    ) -> SyncResult<()>;

    /// Removes a record and its snapshot.
    fn remove(&self, collection: &str, id: &str) -> SyncResult<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    record: Record,
    snapshot: Option<SyncedSnapshot>,
}

/// An in-memory replica for tests and simulation.
#[derive(Debug, Default)]
pub struct MemoryReplica {
    collections: RwLock<HashMap<String, BTreeMap<RecordId, Entry>>>,
}

impl MemoryReplica {
    /// Creates an empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a local edit, creating the record if needed.
    pub fn upsert_local(&self, collection: &str, id: &str, fields: Payload) -> Record {
        let mut collections = self.collections.write();
        let records = collections.entry(collection.to_string()).or_default();
        let entry = records.entry(id.to_string()).or_insert_with(|| Entry {
            record: Record::new(id, Payload::new()),
            snapshot: None,
        });
        entry.record.deleted = false;
        entry.record.apply_local_edit(fields);
        entry.record.clone()
    }

    /// Soft-deletes a record locally. Returns false if it does not exist.
    pub fn delete_local(&self, collection: &str, id: &str) -> bool {
        let mut collections = self.collections.write();
        match collections.get_mut(collection).and_then(|records| records.get_mut(id)) {
            Some(entry) => {
                entry.record.mark_deleted();
                true
            }
            None => false,
        }
    }

    /// Number of records in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |records| records.len())
    }

    /// Returns true if the collection holds no records.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

impl LocalReplica for MemoryReplica {
    fn read(&self, collection: &str, id: &str) -> SyncResult<Option<Record>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|records| records.get(id))
            .map(|entry| entry.record.clone()))
    }

    fn write(&self, collection: &str, record: Record) -> SyncResult<()> {
        let mut collections = self.collections.write();
        let records = collections.entry(collection.to_string()).or_default();
        match records.get_mut(&record.id) {
            Some(entry) => entry.record = record,
            None => {
                records.insert(
                    record.id.clone(),
                    Entry {
                        record,
                        snapshot: None,
                    },
                );
            }
        }
        Ok(())
    }

    fn list(&self, collection: &str) -> SyncResult<Vec<Record>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|records| records.values().map(|entry| entry.record.clone()).collect())
            .unwrap_or_default())
    }

    fn last_synced(&self, collection: &str, id: &str) -> SyncResult<Option<SyncedSnapshot>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|records| records.get(id))
            .and_then(|entry| entry.snapshot.clone()))
    }

    fn mark_synced(
        &self,
        collection: &str,
        id: &str,
        sent: &Payload,
        confirmed: &Payload,
        remote_version: u64,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut collections = self.collections.write();
        let entry = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| SyncError::Replica(format!("{collection}/{id} not found")))?;

        if entry.record.fields == *sent {
            entry.record.fields = confirmed.clone();
        }
        entry.record.mark_synced(confirmed, at);
        entry.snapshot = Some(SyncedSnapshot {
            payload: confirmed.clone(),
            remote_version,
            synced_at: at,
        });
        Ok(())
    }

    fn record_remote(&self, collection: &str, id: &str, snapshot: SyncedSnapshot) -> SyncResult<()> {
        let mut collections = self.collections.write();
        let entry = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| SyncError::Replica(format!("{collection}/{id} not found")))?;
        entry.snapshot = Some(snapshot);
        Ok(())
    }

    fn apply_remote(
        &self,
        collection: &str,
        id: &str,
        payload: Payload,
        remote_version: u64,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut collections = self.collections.write();
        let records = collections.entry(collection.to_string()).or_default();
        let entry = records.entry(id.to_string()).or_insert_with(|| Entry {
            record: Record::new(id, Payload::new()),
            snapshot: None,
        });
        entry.record.fields = payload.clone();
        entry.record.deleted = false;
        entry.record.mark_synced(&payload, at);
        entry.snapshot = Some(SyncedSnapshot {
            payload,
            remote_version,
            synced_at: at,
        });
        Ok(())
    }

    fn remove(&self, collection: &str, id: &str) -> SyncResult<()> {
        if let Some(records) = self.collections.write().get_mut(collection) {
            records.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn fields(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn local_edits_are_dirty() {
        let replica = MemoryReplica::new();
        replica.upsert_local("notes", "n1", fields(json!({"title": "a"})));
        replica.upsert_local("notes", "n2", fields(json!({"title": "b"})));

        assert_eq!(replica.list("notes").unwrap().len(), 2);
        assert_eq!(replica.list_dirty("notes").unwrap().len(), 2);
        assert!(replica.last_synced("notes", "n1").unwrap().is_none());
        assert!(replica.list("missing").unwrap().is_empty());
    }

    #[test]
    fn mark_synced_adopts_server_payload() {
        let replica = MemoryReplica::new();
        let sent = fields(json!({"title": "a"}));
        replica.upsert_local("notes", "n1", sent.clone());

        let confirmed = fields(json!({"title": "a", "stamp": 1}));
        replica
            .mark_synced("notes", "n1", &sent, &confirmed, 1, Utc::now())
            .unwrap();

        let record = replica.read("notes", "n1").unwrap().unwrap();
        assert!(!record.dirty);
        assert_eq!(record.sync_version, 1);
        assert_eq!(record.fields, confirmed);
        assert_eq!(replica.last_synced("notes", "n1").unwrap().unwrap().remote_version, 1);
    }

    #[test]
    fn mark_synced_keeps_newer_edits() {
        let replica = MemoryReplica::new();
        let sent = fields(json!({"title": "a"}));
        replica.upsert_local("notes", "n1", sent.clone());
        replica.upsert_local("notes", "n1", fields(json!({"title": "b"})));

        replica.mark_synced("notes", "n1", &sent, &sent, 1, Utc::now()).unwrap();
        let record = replica.read("notes", "n1").unwrap().unwrap();
        assert!(record.dirty);
        assert_eq!(record.fields["title"], "b");
        assert_eq!(replica.last_synced("notes", "n1").unwrap().unwrap().payload, sent);
    }

    #[test]
    fn apply_remote_and_remove() {
        let replica = MemoryReplica::new();
        replica
            .apply_remote("notes", "r1", fields(json!({"title": "remote"})), 3, Utc::now())
            .unwrap();
        let record = replica.read("notes", "r1").unwrap().unwrap();
        assert!(!record.dirty);
        assert_eq!(record.sync_version, 1);

        assert!(replica.delete_local("notes", "r1"));
        assert_eq!(replica.list_dirty("notes").unwrap().len(), 1);

        replica.remove("notes", "r1").unwrap();
        assert!(replica.read("notes", "r1").unwrap().is_none());
        assert!(replica.is_empty("notes"));
    }

    #[test]
    fn missing_record_errors() {
        let replica = MemoryReplica::new();
        let snapshot = SyncedSnapshot {
            payload: Payload::new(),
            remote_version: 1,
            synced_at: Utc::now(),
        };
        assert!(matches!(
            replica.record_remote("notes", "nope", snapshot),
            Err(SyncError::Replica(_))
        ));
    }
}
