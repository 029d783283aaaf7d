//! # DriftSync Engine
//!
//! Offline-first sync orchestration.
//!
//! This crate provides:
//! - The `Orchestrator`, tying queue, scheduler and resolvers together
//! - The `BackendAdapter` contract and a scriptable `MockAdapter`
//! - The `LocalReplica` contract and an in-memory `MemoryReplica`
//! - Batch execution strategies
//! - A broadcast event surface
//!
//! ## Architecture
//!
//! Local edits land in the replica and are enqueued as operations. Updates
//! travel as deltas against the last confirmed remote state. The dispatch
//! path sends each admitted operation through the adapter:
//! 1. Success confirms the remote state in the replica
//! 2. A version conflict is resolved and the merged payload requeued, or
//!    parked for an operator when confidence is low
//! 3. Transient failures retry with backoff, others dead-letter
//!
//! The adaptive scheduler decides when each entity syncs, from priority,
//! usage, reliability and device conditions.
//!
//! ## Key Invariants
//!
//! - Operations on one record are sent in enqueue order
//! - A delta is only applied to the base it was computed from
//! - One failing operation never aborts its batch siblings
//! - No work is accepted after `stop`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod batch;
mod config;
mod error;
mod events;
mod mock;
mod orchestrator;
mod replica;
mod state;

pub use adapter::{
    AdapterError, AdapterErrorKind, AdapterResult, BackendAdapter, ConnectionConfig, Query, RemoteChange,
    RemoteRecord, SubscribeOptions, Subscription, SubscriptionId,
};
pub use batch::{BatchConfig, BatchExecutor, BatchOutcome, BatchReport, BatchStrategy};
pub use config::{EngineConfig, EntityConfig};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, QueueChange, SyncEvent};
pub use mock::{MockAdapter, MockCall, MockOp};
pub use orchestrator::{ManualResolution, Orchestrator, ParkedConflict};
pub use replica::{LocalReplica, MemoryReplica, SyncedSnapshot};
pub use state::{EngineStats, OrchestratorState, ProcessReport, PullReport, SyncCounters};
