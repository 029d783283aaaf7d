//! Error types for the sync queue.

use thiserror::Error;

use crate::item::{ItemId, ItemStatus, Priority};

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors returned by queue operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// The target tier holds its maximum number of queued items.
    #[error("{tier} tier is at capacity ({limit} queued items)")]
    TierFull {
        /// Target tier.
        tier: Priority,
        /// Tier limit.
        limit: usize,
    },

    /// The queue is full and no lower-priority item could be evicted.
    #[error("queue is at capacity ({limit} items) and no lower-priority item can be evicted")]
    QueueFull {
        /// Shared limit.
        limit: usize,
    },

    /// The item failed validation.
    #[error("invalid queue item: {0}")]
    InvalidItem(String),

    /// No item with the given ID.
    #[error("queue item not found: {0}")]
    NotFound(ItemId),

    /// The requested operation does not apply to the item's status.
    #[error("invalid status transition for {id} from {from:?} to {to:?}")]
    InvalidTransition {
        /// Item ID.
        id: ItemId,
        /// Current status.
        from: ItemStatus,
        /// Requested status.
        to: ItemStatus,
    },

    /// The queue no longer accepts items.
    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    /// Returns true for capacity rejections. The caller may retry later.
    pub fn is_capacity(&self) -> bool {
        matches!(self, QueueError::TierFull { .. } | QueueError::QueueFull { .. })
    }
}
