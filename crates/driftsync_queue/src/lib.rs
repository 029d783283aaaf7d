//! # DriftSync Queue
//!
//! Priority queue and concurrency controller for pending sync operations.
//!
//! This crate provides:
//! - `QueueItem` with a forward-only `ItemStatus` state machine
//! - Four priority tiers, each with its own counting permit pool
//! - Exponential backoff with jitter and a bounded dead-letter store
//! - Parking of items awaiting manual conflict resolution
//! - Dynamic cap rebalancing under sustained overload
//!
//! ## Ordering
//!
//! Dispatch is strictly by tier and FIFO within a tier. Operations on the
//! same record are never reordered relative to each other, even across
//! tiers.
//!
//! ## Example
//!
//! ```rust
//! use driftsync_queue::{OperationKind, OperationPayload, Priority, PriorityQueue, QueueItem};
//! use std::time::Instant;
//!
//! let queue = PriorityQueue::default();
//! let item = QueueItem::new("notes", "n1", OperationKind::Delete, OperationPayload::Empty)
//!     .with_priority(Priority::High);
//! let id = queue.enqueue(item).unwrap().id;
//!
//! let admitted = queue.dequeue(Instant::now()).unwrap();
//! assert_eq!(admitted.id, id);
//! queue.complete(id).unwrap();
//! assert!(queue.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod item;
mod permit;
mod queue;

pub use config::{OverloadConfig, QueueConfig, RetryConfig, TierConfig};
pub use error::{QueueError, QueueResult};
pub use item::{ItemId, ItemStatus, OperationKind, OperationPayload, Priority, QueueItem};
pub use permit::{Permit, PermitPool};
pub use queue::{
    EnqueueOutcome, FailOutcome, PriorityQueue, QueueStats, RebalanceChange, TierStats,
    DISCARDED_REASON, EVICTED_REASON,
};
