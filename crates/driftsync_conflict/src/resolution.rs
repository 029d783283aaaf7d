//! Resolution results.

use driftsync_core::{Payload, RecordId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::strategy::MergeStrategy;

/// What the resolver decided to do with a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Resubmit the local version unchanged.
    UseLocal,
    /// Accept the remote version.
    UseRemote,
    /// Resubmit a merge of both versions.
    Merged,
    /// Leave the case for a human.
    DeferredToManual,
}

/// Where a resolved field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Taken from the local version.
    Local,
    /// Taken from the remote version.
    Remote,
    /// Combined from both versions.
    Merged,
}

/// How one field was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResolution {
    /// Dotted path of the field.
    pub path: String,
    /// Strategy used.
    pub strategy: MergeStrategy,
    /// Source of the resolved value.
    pub provenance: Provenance,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Outcome of resolving one `ConflictCase`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedResolution {
    /// The case this resolves.
    pub case_id: Uuid,
    /// Collection name.
    pub collection: String,
    /// Record ID.
    pub record_id: RecordId,
    /// Name of the resolver that produced this result.
    pub resolver: String,
    /// Decision.
    pub action: ResolutionAction,
    /// Merged payload. For deferred cases this is the suggested merge.
    pub merged: Payload,
    /// Aggregate confidence in `[0, 1]`.
    pub confidence: f64,
    /// Per-field provenance, one entry per diverging field path.
    pub fields: Vec<FieldResolution>,
}

impl EnhancedResolution {
    /// Returns true if the merged payload can be resubmitted automatically.
    pub fn is_auto_resolved(&self) -> bool {
        self.action != ResolutionAction::DeferredToManual
    }

    /// Returns true if the resolution changes nothing.
    pub fn is_noop(&self) -> bool {
        self.fields.is_empty() && self.action == ResolutionAction::Merged
    }

    /// Strategies used, deduplicated, in first-use order.
    pub fn strategies(&self) -> Vec<MergeStrategy> {
        let mut seen = Vec::new();
        for field in &self.fields {
            if !seen.contains(&field.strategy) {
                seen.push(field.strategy);
            }
        }
        seen
    }
}
