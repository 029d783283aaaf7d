//! A scripted in-memory backend for tests and simulation.

use async_trait::async_trait;
use chrono::Utc;
use driftsync_core::{apply_delta, DeltaPatch, Payload, RecordId};
use driftsync_queue::OperationKind;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::adapter::{
    AdapterError, AdapterErrorKind, AdapterResult, BackendAdapter, ConnectionConfig, Query, RemoteChange,
    RemoteRecord, SubscribeOptions, Subscription, SubscriptionId,
};

/// Adapter call kinds, for scripting and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockOp {
    /// `connect`.
    Connect,
    /// `create`.
    Create,
    /// `read`.
    Read,
    /// `update`.
    Update,
    /// `patch`.
    Patch,
    /// `delete`.
    Delete,
    /// `query`.
    Query,
    /// `subscribe`.
    Subscribe,
}

/// One logged adapter call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockCall {
    /// Call kind.
    pub op: MockOp,
    /// Collection.
    pub collection: String,
    /// Record, for single-record calls.
    pub record_id: Option<RecordId>,
}

struct Subscriber {
    collection: String,
    query: Query,
    sender: mpsc::Sender<RemoteChange>,
}

/// A backend that keeps records in memory with optimistic versioning.
///
/// Failures can be scripted per call kind; scripted failures are consumed
/// in order before the store is consulted.
pub struct MockAdapter {
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    supports_patch: bool,
    store: RwLock<HashMap<String, BTreeMap<RecordId, RemoteRecord>>>,
    scripted: Mutex<HashMap<MockOp, VecDeque<AdapterError>>>,
    calls: Mutex<Vec<MockCall>>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
}

impl MockAdapter {
    /// Creates a connected adapter without native patch support.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            refuse_connect: AtomicBool::new(false),
            supports_patch: false,
            store: RwLock::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Accepts `patch` calls natively.
    pub fn with_patch_support(mut self) -> Self {
        self.supports_patch = true;
        self
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes `connect` report a refused connection.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Returns true if connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fails the next call of kind `op` with `error`.
    pub fn push_failure(&self, op: MockOp, error: AdapterError) {
        self.scripted.lock().entry(op).or_default().push_back(error);
    }

    /// Fails the next `times` calls of kind `op` with copies of `error`.
    pub fn push_failures(&self, op: MockOp, error: AdapterError, times: usize) {
        let mut scripted = self.scripted.lock();
        let queue = scripted.entry(op).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Stores a record as if another client had written it, and notifies
    /// subscribers. Returns the stored record.
    pub fn remote_write(&self, collection: &str, id: &str, payload: Payload) -> RemoteRecord {
        let (record, kind) = {
            let mut store = self.store.write();
            let records = store.entry(collection.to_string()).or_default();
            let kind = if records.contains_key(id) {
                OperationKind::Update
            } else {
                OperationKind::Create
            };
            let version = records.get(id).map_or(1, |r| r.version + 1);
            let record = stamped(id, payload, version);
            records.insert(id.to_string(), record.clone());
            (record, kind)
        };
        self.broadcast(collection, id, kind, Some(record.clone()));
        record
    }

    /// Deletes a record as if another client had, and notifies subscribers.
    pub fn remote_delete(&self, collection: &str, id: &str) -> bool {
        let removed = self
            .store
            .write()
            .get_mut(collection)
            .and_then(|records| records.remove(id))
            .is_some();
        if removed {
            self.broadcast(collection, id, OperationKind::Delete, None);
        }
        removed
    }

    /// Current stored record.
    pub fn stored(&self, collection: &str, id: &str) -> Option<RemoteRecord> {
        self.store
            .read()
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned()
    }

    /// Number of stored records in a collection.
    pub fn stored_count(&self, collection: &str) -> usize {
        self.store.read().get(collection).map_or(0, |records| records.len())
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Number of calls of kind `op`.
    pub fn call_count(&self, op: MockOp) -> usize {
        self.calls.lock().iter().filter(|call| call.op == op).count()
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn begin(&self, op: MockOp, collection: &str, record_id: Option<&str>) -> AdapterResult<()> {
        self.calls.lock().push(MockCall {
            op,
            collection: collection.to_string(),
            record_id: record_id.map(str::to_string),
        });
        if op != MockOp::Connect && !self.is_connected() {
            return Err(AdapterError::new(AdapterErrorKind::NotConnected, "not connected"));
        }
        match self.scripted.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn broadcast(&self, collection: &str, id: &str, kind: OperationKind, record: Option<RemoteRecord>) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|_, subscriber| !subscriber.sender.is_closed());
        for subscriber in subscribers.values() {
            if subscriber.collection != collection {
                continue;
            }
            if let Some(record) = &record {
                if !subscriber.query.matches(&record.payload) {
                    continue;
                }
            }
            // A full buffer drops the notification; the next pull catches up.
            let _ = subscriber.sender.try_send(RemoteChange {
                collection: collection.to_string(),
                record_id: id.to_string(),
                kind,
                record: record.clone(),
            });
        }
    }

    fn write_versioned(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<u64>,
        build: impl FnOnce(&RemoteRecord) -> AdapterResult<Payload>,
    ) -> AdapterResult<RemoteRecord> {
        let record = {
            let mut store = self.store.write();
            let current = store
                .get(collection)
                .and_then(|records| records.get(id))
                .cloned()
                .ok_or_else(|| AdapterError::not_found(collection, id))?;
            if expected_version.is_some_and(|expected| expected != current.version) {
                return Err(AdapterError::conflict(collection, id, Some(current)));
            }
            let payload = build(&current)?;
            let record = stamped(id, payload, current.version + 1);
            store
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), record.clone());
            record
        };
        self.broadcast(collection, id, OperationKind::Update, Some(record.clone()));
        Ok(record)
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("connected", &self.is_connected())
            .field("supports_patch", &self.supports_patch)
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

fn stamped(id: &str, payload: Payload, version: u64) -> RemoteRecord {
    RemoteRecord {
        id: id.to_string(),
        payload,
        version,
        updated_at: Some(Utc::now()),
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, config: &ConnectionConfig) -> AdapterResult<bool> {
        self.begin(MockOp::Connect, &config.endpoint, None)?;
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.set_connected(true);
        Ok(true)
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        self.set_connected(false);
        self.subscribers.lock().clear();
        Ok(())
    }

    async fn create(&self, collection: &str, id: &str, payload: &Payload) -> AdapterResult<RemoteRecord> {
        self.begin(MockOp::Create, collection, Some(id))?;
        let record = {
            let mut store = self.store.write();
            let records = store.entry(collection.to_string()).or_default();
            if let Some(existing) = records.get(id) {
                return Err(AdapterError::conflict(collection, id, Some(existing.clone())));
            }
            let record = stamped(id, payload.clone(), 1);
            records.insert(id.to_string(), record.clone());
            record
        };
        self.broadcast(collection, id, OperationKind::Create, Some(record.clone()));
        Ok(record)
    }

    async fn read(&self, collection: &str, id: &str) -> AdapterResult<RemoteRecord> {
        self.begin(MockOp::Read, collection, Some(id))?;
        self.stored(collection, id)
            .ok_or_else(|| AdapterError::not_found(collection, id))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        payload: &Payload,
        expected_version: Option<u64>,
    ) -> AdapterResult<RemoteRecord> {
        self.begin(MockOp::Update, collection, Some(id))?;
        self.write_versioned(collection, id, expected_version, |_| Ok(payload.clone()))
    }

    async fn patch(
        &self,
        collection: &str,
        id: &str,
        patch: &DeltaPatch,
        expected_version: Option<u64>,
    ) -> AdapterResult<RemoteRecord> {
        self.begin(MockOp::Patch, collection, Some(id))?;
        if !self.supports_patch {
            return Err(AdapterError::unsupported("patch"));
        }
        self.write_versioned(collection, id, expected_version, |current| {
            apply_delta(&current.payload, patch, true)
                .map_err(|err| AdapterError::validation(err.to_string()).for_record(collection, id))
        })
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: Option<u64>) -> AdapterResult<()> {
        self.begin(MockOp::Delete, collection, Some(id))?;
        {
            let mut store = self.store.write();
            let Some(records) = store.get_mut(collection) else {
                return Ok(());
            };
            if let Some(current) = records.get(id) {
                if expected_version.is_some_and(|expected| expected != current.version) {
                    return Err(AdapterError::conflict(collection, id, Some(current.clone())));
                }
            }
            if records.remove(id).is_none() {
                return Ok(());
            }
        }
        self.broadcast(collection, id, OperationKind::Delete, None);
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> AdapterResult<Vec<RemoteRecord>> {
        self.begin(MockOp::Query, collection, None)?;
        let mut records: Vec<RemoteRecord> = self
            .store
            .read()
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|record| query.matches(&record.payload))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(field) = &query.sort_by {
            records.sort_by(|a, b| {
                let left = a.payload.get(field).map(|v| v.to_string()).unwrap_or_default();
                let right = b.payload.get(field).map(|v| v.to_string()).unwrap_or_default();
                left.cmp(&right)
            });
            if query.descending {
                records.reverse();
            }
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(records.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn subscribe(&self, collection: &str, options: &SubscribeOptions) -> AdapterResult<Subscription> {
        self.begin(MockOp::Subscribe, collection, None)?;
        let (sender, changes) = mpsc::channel(options.buffer.max(1));
        let id = Uuid::new_v4();
        self.subscribers.lock().insert(
            id,
            Subscriber {
                collection: collection.to_string(),
                query: options.query.clone(),
                sender,
            },
        );
        Ok(Subscription {
            id,
            collection: collection.to_string(),
            changes,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> AdapterResult<()> {
        self.subscribers.lock().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::calculate_delta;
    use serde_json::{json, Value};

    fn fields(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn versioned_updates() {
        let adapter = MockAdapter::new();
        let created = adapter.create("notes", "n1", &fields(json!({"v": 1}))).await.unwrap();
        assert_eq!(created.version, 1);

        let updated = adapter
            .update("notes", "n1", &fields(json!({"v": 2})), Some(1))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let stale = adapter
            .update("notes", "n1", &fields(json!({"v": 3})), Some(1))
            .await
            .unwrap_err();
        assert!(stale.is_conflict());
        assert_eq!(stale.remote.map(|r| r.version), Some(2));

        let missing = adapter.update("notes", "n9", &Payload::new(), None).await.unwrap_err();
        assert_eq!(missing.kind, AdapterErrorKind::NotFound);
    }

    #[tokio::test]
    async fn create_conflicts_when_present() {
        let adapter = MockAdapter::new();
        adapter.remote_write("notes", "n1", fields(json!({"title": "theirs"})));
        let err = adapter.create("notes", "n1", &Payload::new()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.remote.unwrap().payload["title"], "theirs");
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let adapter = MockAdapter::new();
        adapter.push_failure(MockOp::Create, AdapterError::timeout("slow"));
        adapter.push_failure(MockOp::Create, AdapterError::rate_limited("busy"));

        let first = adapter.create("notes", "n1", &Payload::new()).await.unwrap_err();
        assert_eq!(first.kind, AdapterErrorKind::Timeout);
        let second = adapter.create("notes", "n1", &Payload::new()).await.unwrap_err();
        assert_eq!(second.kind, AdapterErrorKind::RateLimited);
        assert!(adapter.create("notes", "n1", &Payload::new()).await.is_ok());
        assert_eq!(adapter.call_count(MockOp::Create), 3);
    }

    #[tokio::test]
    async fn disconnected_calls_fail_transiently() {
        let adapter = MockAdapter::new();
        adapter.set_connected(false);
        let err = adapter.read("notes", "n1").await.unwrap_err();
        assert!(err.is_transient());

        assert!(adapter.connect(&ConnectionConfig::new("mock://")).await.unwrap());
        adapter.refuse_connections(true);
        assert!(!adapter.connect(&ConnectionConfig::new("mock://")).await.unwrap());
    }

    #[tokio::test]
    async fn patch_support() {
        let plain = MockAdapter::new();
        plain.remote_write("notes", "n1", fields(json!({"a": 1})));
        let patch = calculate_delta(&fields(json!({"a": 1})), &fields(json!({"a": 2})));
        let err = plain.patch("notes", "n1", &patch, Some(1)).await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Unsupported);

        let native = MockAdapter::new().with_patch_support();
        native.remote_write("notes", "n1", fields(json!({"a": 1})));
        let record = native.patch("notes", "n1", &patch, Some(1)).await.unwrap();
        assert_eq!(record.payload, fields(json!({"a": 2})));

        native.remote_write("notes", "n1", fields(json!({"a": 5})));
        let stale_base = native.patch("notes", "n1", &patch, None).await.unwrap_err();
        assert_eq!(stale_base.kind, AdapterErrorKind::Validation);
    }

    #[tokio::test]
    async fn query_filters_sorts_and_pages() {
        let adapter = MockAdapter::new();
        for (id, rank, done) in [("a", 3, true), ("b", 1, true), ("c", 2, false)] {
            adapter.remote_write("tasks", id, fields(json!({"rank": rank, "done": done})));
        }
        let done = adapter
            .query("tasks", &Query::all().filter("done", json!(true)).sort_by("rank", false))
            .await
            .unwrap();
        let ids: Vec<&str> = done.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let page = adapter.query("tasks", &Query::all().page(1, 1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "b");
    }

    #[tokio::test]
    async fn subscribers_receive_changes() {
        let adapter = MockAdapter::new();
        let mut subscription = adapter
            .subscribe("notes", &SubscribeOptions::default())
            .await
            .unwrap();
        adapter.remote_write("notes", "n1", fields(json!({"x": 1})));
        adapter.remote_write("other", "o1", Payload::new());
        adapter.remote_delete("notes", "n1");

        let first = subscription.changes.recv().await.unwrap();
        assert_eq!(first.kind, OperationKind::Create);
        let second = subscription.changes.recv().await.unwrap();
        assert_eq!(second.kind, OperationKind::Delete);
        assert!(second.record.is_none());

        adapter.unsubscribe(subscription.id).await.unwrap();
        assert_eq!(adapter.subscriber_count(), 0);
        assert!(subscription.changes.recv().await.is_none());
    }
}
