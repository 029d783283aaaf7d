//! # DriftSync Testkit
//!
//! Test utilities for DriftSync.
//!
//! This crate provides:
//! - Fixtures wiring an orchestrator to the mock backend
//! - Property-based test generators using proptest
//! - Delta test vectors shared across crates
//! - Queue stress utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use driftsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs_a_record() {
//!     let harness = SyncHarness::new();
//!     harness.register("notes", EntityConfig::default());
//!     harness.seed("notes", "n1", serde_json::json!({"title": "hello"})).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use crate::vectors::*;
    pub use driftsync_engine::EntityConfig;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
pub use vectors::*;
