//! Field-level patches between two payload versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::{checksum, Checksum};
use crate::error::{CoreError, CoreResult};
use crate::record::Payload;

/// Minimal transform from one payload version to the next.
///
/// # Invariants
///
/// - Validated application requires `checksum(base) == source_checksum`
/// - Re-applying a patch to its own output (unvalidated) is a no-op
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPatch {
    /// Checksum of the payload the patch was computed from.
    pub source_checksum: Checksum,
    /// Checksum of the payload the patch produces.
    pub target_checksum: Checksum,
    /// Fields that were added or changed, with their new values.
    pub changes: Payload,
    /// Keys removed from the source.
    pub deletions: Vec<String>,
    /// When the patch was computed.
    pub computed_at: DateTime<Utc>,
}

impl DeltaPatch {
    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.deletions.is_empty()
    }

    /// Number of fields touched by the patch.
    pub fn changed_field_count(&self) -> usize {
        self.changes.len() + self.deletions.len()
    }

    /// Returns true if the patch touches `field`.
    pub fn touches(&self, field: &str) -> bool {
        self.changes.contains_key(field) || self.deletions.iter().any(|k| k == field)
    }
}

/// Computes the patch that turns `old` into `new`.
pub fn calculate_delta(old: &Payload, new: &Payload) -> DeltaPatch {
    let changes: Payload = new
        .iter()
        .filter(|(key, value)| old.get(key.as_str()) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let mut deletions: Vec<String> = old
        .keys()
        .filter(|key| !new.contains_key(key.as_str()))
        .cloned()
        .collect();
    deletions.sort();

    DeltaPatch {
        source_checksum: checksum(old),
        target_checksum: checksum(new),
        changes,
        deletions,
        computed_at: Utc::now(),
    }
}

/// Applies `patch` to `base`: changes first, then deletions.
///
/// With `validate_checksum`, fails if `base` is not the payload the patch
/// was computed from, or if the result does not match the recorded target.
pub fn apply_delta(base: &Payload, patch: &DeltaPatch, validate_checksum: bool) -> CoreResult<Payload> {
    if validate_checksum {
        let actual = checksum(base);
        if actual != patch.source_checksum {
            return Err(CoreError::SourceChecksumMismatch {
                expected: patch.source_checksum,
                actual,
            });
        }
    }

    let mut result = base.clone();
    for (key, value) in &patch.changes {
        result.insert(key.clone(), value.clone());
    }
    for key in &patch.deletions {
        result.remove(key);
    }

    if validate_checksum {
        let actual = checksum(&result);
        if actual != patch.target_checksum {
            return Err(CoreError::TargetChecksumMismatch {
                expected: patch.target_checksum,
                actual,
            });
        }
    }

    Ok(result)
}
