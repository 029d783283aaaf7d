//! # DriftSync Conflict
//!
//! Three-way, field-level conflict resolution for DriftSync.
//!
//! This crate provides:
//! - `ConflictCase` detection from a (base, local, remote) triple
//! - A value-shape classifier mapped to a fixed merge-strategy table
//! - `FieldMergeResolver`, producing a merged payload with a confidence score
//! - Fixed-policy resolvers (last-write-wins, local-wins, remote-wins, manual)
//! - `ResolverRegistry` with per-collection overrides
//! - `ResolutionHistory` with nearest-neighbour strategy suggestions
//!
//! ## Failure Semantics
//!
//! Resolution never fails. Uncertainty is reported as a low confidence
//! score, and a score below the configured threshold defers the case to
//! manual resolution instead of auto-merging it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod case;
mod config;
mod history;
mod registry;
mod resolution;
mod resolver;
mod shape;
mod strategy;

pub use case::{ConflictCase, ConflictShape, FieldChange, FieldConflict};
pub use config::{BooleanPolicy, NumericPolicy, ResolverConfig, ScoreWeights, StrategyConfidence};
pub use history::{ResolutionHistory, ResolutionOutcome, ResolutionRecord, StrategySuggestion};
pub use registry::ResolverRegistry;
pub use resolution::{EnhancedResolution, FieldResolution, Provenance, ResolutionAction};
pub use resolver::{
    ConflictResolver, ConflictStrategy, FieldMergeResolver, LastWriteWinsResolver,
    LocalWinsResolver, ManualResolver, RemoteWinsResolver,
};
pub use shape::{classify, parse_timestamp, ValueShape};
pub use strategy::{text_similarity, MergeStrategy};
