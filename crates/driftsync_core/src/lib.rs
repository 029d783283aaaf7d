//! # DriftSync Core
//!
//! Record model and delta engine for DriftSync.
//!
//! This crate provides:
//! - `Record`, the syncable unit owned by the local replica
//! - Canonical serialization and SHA-256 checksums of payloads
//! - `DeltaPatch` computation and checksum-gated application
//! - Collection-level create/update/delete sets
//!
//! This is a pure crate with no I/O operations.
//!
//! ## Key Invariants
//!
//! - Two semantically equal payloads always have the same checksum,
//!   independent of map construction order
//! - `apply_delta` with validation is only defined on the exact base the
//!   patch was computed from
//! - `sync_version` increases by exactly one per confirmed remote write

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod collection;
mod delta;
mod error;
mod record;

pub use checksum::{canonical_bytes, checksum, Checksum};
pub use collection::{calculate_collection_delta, CollectionDelta};
pub use delta::{apply_delta, calculate_delta, DeltaPatch};
pub use error::{CoreError, CoreResult};
pub use record::{payload_from_value, Payload, Record, RecordId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
