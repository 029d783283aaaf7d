//! Backend adapter contract.
//!
//! One adapter exists per backend service. The orchestrator only ever
//! talks to remote storage through this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftsync_core::{DeltaPatch, Payload, RecordId};
use driftsync_queue::OperationKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Result type for adapter calls.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Handle identifying a subscription.
pub type SubscriptionId = Uuid;

/// Connection settings handed to [`BackendAdapter::connect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Backend endpoint.
    pub endpoint: String,
    /// Per-request timeout in milliseconds, enforced by the adapter.
    pub timeout_ms: u64,
    /// Backend-specific options.
    pub options: HashMap<String, String>,
}

impl ConnectionConfig {
    /// Creates a configuration for `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets a backend-specific option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_ms: 30_000,
            options: HashMap::new(),
        }
    }
}

/// A record as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Record ID.
    pub id: RecordId,
    /// Payload, possibly mutated by the server.
    pub payload: Payload,
    /// Server-side version, used for optimistic locking.
    pub version: u64,
    /// Server-side modification time.
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteRecord {
    /// Creates a remote record.
    pub fn new(id: impl Into<RecordId>, payload: Payload, version: u64) -> Self {
        Self {
            id: id.into(),
            payload,
            version,
            updated_at: None,
        }
    }
}

/// Filter, sort and page for [`BackendAdapter::query`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    /// Fields that must equal the given values.
    pub filter: Payload,
    /// Field to sort by.
    pub sort_by: Option<String>,
    /// Sort descending.
    pub descending: bool,
    /// Records to skip.
    pub offset: usize,
    /// Maximum records to return.
    pub limit: Option<usize>,
}

impl Query {
    /// Every record of a collection.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds an equality filter.
    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter.insert(field.into(), value);
        self
    }

    /// Sorts by `field`.
    pub fn sort_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.sort_by = Some(field.into());
        self.descending = descending;
        self
    }

    /// Pages the result.
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Returns true if `payload` passes the filter.
    pub fn matches(&self, payload: &Payload) -> bool {
        self.filter
            .iter()
            .all(|(field, expected)| payload.get(field) == Some(expected))
    }
}

/// Options for [`BackendAdapter::subscribe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    /// Channel buffer size.
    pub buffer: usize,
    /// Only changes matching this query are delivered.
    pub query: Query,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            buffer: 64,
            query: Query::default(),
        }
    }
}

/// A change pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Collection name.
    pub collection: String,
    /// Record ID.
    pub record_id: RecordId,
    /// What happened.
    pub kind: OperationKind,
    /// New remote state, absent for deletes.
    pub record: Option<RemoteRecord>,
}

/// An open subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Handle for [`BackendAdapter::unsubscribe`].
    pub id: SubscriptionId,
    /// Collection watched.
    pub collection: String,
    /// Change stream. Ends when the subscription is closed.
    pub changes: mpsc::Receiver<RemoteChange>,
}

/// Category of an adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    /// Version or optimistic-lock rejection.
    Conflict,
    /// The backend rejected the payload.
    Validation,
    /// The target record does not exist.
    NotFound,
    /// Temporary failure.
    Transient,
    /// The call exceeded its timeout.
    Timeout,
    /// The backend throttled the call.
    RateLimited,
    /// The adapter is not connected.
    NotConnected,
    /// The adapter does not implement the call.
    Unsupported,
    /// Any other failure that retrying will not fix.
    Permanent,
}

impl AdapterErrorKind {
    /// Returns true if the call may succeed when retried.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Timeout | Self::RateLimited | Self::NotConnected
        )
    }
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Conflict => "conflict",
            Self::Validation => "validation",
            Self::NotFound => "not found",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate limited",
            Self::NotConnected => "not connected",
            Self::Unsupported => "unsupported",
            Self::Permanent => "permanent",
        };
        f.write_str(name)
    }
}

/// Typed failure of an adapter call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    /// Failure category.
    pub kind: AdapterErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Collection involved, if known.
    pub collection: Option<String>,
    /// Record involved, if known.
    pub record_id: Option<RecordId>,
    /// Current remote state, carried by conflict rejections.
    pub remote: Option<RemoteRecord>,
}

impl AdapterError {
    /// Creates an error of `kind`.
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            collection: None,
            record_id: None,
            remote: None,
        }
    }

    /// Attaches the record the error is about.
    pub fn for_record(mut self, collection: impl Into<String>, record_id: impl Into<RecordId>) -> Self {
        self.collection = Some(collection.into());
        self.record_id = Some(record_id.into());
        self
    }

    /// Version conflict, optionally carrying the current remote state.
    pub fn conflict(collection: &str, record_id: &str, remote: Option<RemoteRecord>) -> Self {
        let mut err = Self::new(
            AdapterErrorKind::Conflict,
            format!("version conflict on {collection}/{record_id}"),
        )
        .for_record(collection, record_id);
        err.remote = remote;
        err
    }

    /// Missing record.
    pub fn not_found(collection: &str, record_id: &str) -> Self {
        Self::new(AdapterErrorKind::NotFound, format!("{collection}/{record_id} not found"))
            .for_record(collection, record_id)
    }

    /// Rejected payload.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Validation, message)
    }

    /// Temporary failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Transient, message)
    }

    /// Timed-out call.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, message)
    }

    /// Throttled call.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::RateLimited, message)
    }

    /// Call not implemented by the adapter.
    pub fn unsupported(operation: &str) -> Self {
        Self::new(AdapterErrorKind::Unsupported, format!("{operation} is not supported"))
    }

    /// Failure that will not go away.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Permanent, message)
    }

    /// Returns true if the call may succeed when retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Returns true for version conflicts.
    pub fn is_conflict(&self) -> bool {
        self.kind == AdapterErrorKind::Conflict
    }
}

/// Access to one remote backend.
///
/// Implementations enforce their own timeouts and report an expired call
/// as [`AdapterErrorKind::Timeout`]. `expected_version` carries the version
/// the local change was based on; a mismatch must be rejected with a
/// conflict error, ideally carrying the current remote record.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Opens the connection. Returns false if the backend refused it.
    async fn connect(&self, config: &ConnectionConfig) -> AdapterResult<bool>;

    /// Closes the connection.
    async fn disconnect(&self) -> AdapterResult<()>;

    /// Creates a record. Fails with a conflict if it already exists.
    async fn create(&self, collection: &str, id: &str, payload: &Payload) -> AdapterResult<RemoteRecord>;

    /// Reads a record.
    async fn read(&self, collection: &str, id: &str) -> AdapterResult<RemoteRecord>;

    /// Replaces a record's payload.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        payload: &Payload,
        expected_version: Option<u64>,
    ) -> AdapterResult<RemoteRecord>;

    /// Applies a field-level patch.
    ///
    /// The default reports the call as unsupported, in which case the
    /// orchestrator sends the full payload through [`update`](Self::update).
    async fn patch(
        &self,
        collection: &str,
        id: &str,
        patch: &DeltaPatch,
        expected_version: Option<u64>,
    ) -> AdapterResult<RemoteRecord> {
        let _ = (collection, id, patch, expected_version);
        Err(AdapterError::unsupported("patch"))
    }

    /// Deletes a record.
    async fn delete(&self, collection: &str, id: &str, expected_version: Option<u64>) -> AdapterResult<()>;

    /// Lists records.
    async fn query(&self, collection: &str, query: &Query) -> AdapterResult<Vec<RemoteRecord>>;

    /// Opens a change stream for a collection.
    async fn subscribe(&self, collection: &str, options: &SubscribeOptions) -> AdapterResult<Subscription>;

    /// Closes a change stream.
    async fn unsubscribe(&self, id: SubscriptionId) -> AdapterResult<()>;
}
