//! Error types for the sync engine.

use driftsync_core::CoreError;
use driftsync_queue::QueueError;
use driftsync_scheduler::SchedulerError;
use thiserror::Error;

use crate::adapter::{AdapterError, AdapterErrorKind};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned to callers of the orchestrator.
///
/// Failures of individual queued operations are not returned this way;
/// they surface as events and item state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Checksum mismatch or malformed payload. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Timeout, rate limit or lost connectivity.
    #[error("transient error: {0}")]
    Transient(String),

    /// Version rejection from the backend.
    #[error("version conflict on {collection}/{record_id}")]
    Conflict {
        /// Collection name.
        collection: String,
        /// Record ID.
        record_id: String,
    },

    /// Queue tier or shared capacity exhausted.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// The backend will never accept the operation.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The entity was never registered.
    #[error("entity not registered: {0}")]
    NotRegistered(String),

    /// The orchestrator has been stopped.
    #[error("orchestrator stopped")]
    Stopped,

    /// The local replica failed.
    #[error("replica error: {0}")]
    Replica(String),

    /// The backend adapter could not be used at all.
    #[error("adapter error: {0}")]
    Adapter(String),
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Returns true for capacity rejections.
    pub fn is_capacity(&self) -> bool {
        matches!(self, SyncError::Capacity(_))
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<QueueError> for SyncError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Closed => SyncError::Stopped,
            err if err.is_capacity() => SyncError::Capacity(err.to_string()),
            err => SyncError::Validation(err.to_string()),
        }
    }
}

impl From<SchedulerError> for SyncError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NotRegistered(name) => SyncError::NotRegistered(name),
            err => SyncError::Validation(err.to_string()),
        }
    }
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        match err.kind {
            AdapterErrorKind::Conflict => SyncError::Conflict {
                collection: err.collection.unwrap_or_default(),
                record_id: err.record_id.unwrap_or_default(),
            },
            AdapterErrorKind::Validation => SyncError::Validation(err.message),
            kind if kind.is_transient() => SyncError::Transient(err.message),
            AdapterErrorKind::NotConnected => SyncError::Adapter(err.message),
            _ => SyncError::Permanent(err.message),
        }
    }
}
