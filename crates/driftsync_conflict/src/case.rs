//! Conflict cases and per-field divergence.

use chrono::{DateTime, Utc};
use driftsync_core::{Payload, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::shape::{classify_field, ValueShape};

/// Which side changed a field relative to the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldChange {
    /// Only the local side changed the field.
    LocalOnly,
    /// Only the remote side changed the field.
    RemoteOnly,
    /// Both sides changed the field differently, or there is no base.
    Both,
}

/// A single diverging field.
///
/// `None` means the field is absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// Field key.
    pub field: String,
    /// Base value.
    pub base: Option<Value>,
    /// Local value.
    pub local: Option<Value>,
    /// Remote value.
    pub remote: Option<Value>,
    /// Which side changed.
    pub change: FieldChange,
}

impl FieldConflict {
    /// Returns true if both sides changed the field.
    pub fn is_true_conflict(&self) -> bool {
        self.change == FieldChange::Both
    }

    /// Shape of the diverging values; opaque when either side is absent.
    pub fn shape(&self) -> ValueShape {
        match (&self.local, &self.remote) {
            (Some(local), Some(remote)) => classify_field(&self.field, local, remote),
            _ => ValueShape::Opaque,
        }
    }
}

/// A detected divergence between local and remote versions of one record.
///
/// Cases are immutable once created. Resolution produces a new payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCase {
    /// Case ID.
    pub id: Uuid,
    /// Collection name.
    pub collection: String,
    /// Record ID.
    pub record_id: RecordId,
    /// Last confirmed version, if any.
    pub base: Option<Payload>,
    /// Local pending version.
    pub local: Payload,
    /// Remote version.
    pub remote: Payload,
    /// Diverging fields, sorted by key.
    pub fields: Vec<FieldConflict>,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
}

impl ConflictCase {
    /// Builds a case and computes its per-field divergence.
    pub fn new(
        collection: impl Into<String>,
        record_id: impl Into<RecordId>,
        base: Option<Payload>,
        local: Payload,
        remote: Payload,
    ) -> Self {
        let fields = diverging_fields(base.as_ref(), &local, &remote);
        Self {
            id: Uuid::new_v4(),
            collection: collection.into(),
            record_id: record_id.into(),
            base,
            local,
            remote,
            fields,
            detected_at: Utc::now(),
        }
    }

    /// Returns true if local and remote agree on every field.
    pub fn is_identical(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields changed on both sides.
    pub fn true_conflicts(&self) -> impl Iterator<Item = &FieldConflict> {
        self.fields.iter().filter(|f| f.is_true_conflict())
    }

    /// Returns true if some field changed on both sides.
    pub fn has_true_conflicts(&self) -> bool {
        self.true_conflicts().next().is_some()
    }

    /// Shape summary used to compare cases.
    pub fn shape(&self) -> ConflictShape {
        let mut shape = ConflictShape::default();
        for field in &self.fields {
            if field.is_true_conflict() {
                shape.fields.insert(field.field.clone());
                *shape.shapes.entry(field.shape()).or_insert(0) += 1;
            } else {
                shape.one_sided += 1;
            }
        }
        shape
    }
}

/// Summary of which fields conflict and how.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictShape {
    /// Keys changed on both sides.
    pub fields: BTreeSet<String>,
    /// Count of true conflicts per value shape.
    pub shapes: BTreeMap<ValueShape, usize>,
    /// Count of one-sided changes.
    pub one_sided: usize,
}

impl ConflictShape {
    /// Distance in `[0, 1]` between two shapes.
    ///
    /// Blends the Jaccard distance of the conflicting keys with the
    /// normalised L1 distance of the shape histograms.
    pub fn distance(&self, other: &ConflictShape) -> f64 {
        let union = self.fields.union(&other.fields).count();
        let key_distance = if union == 0 {
            0.0
        } else {
            let shared = self.fields.intersection(&other.fields).count();
            1.0 - shared as f64 / union as f64
        };

        let kinds: BTreeSet<&ValueShape> = self.shapes.keys().chain(other.shapes.keys()).collect();
        let mut diff = 0usize;
        let mut total = 0usize;
        for kind in kinds {
            let a = self.shapes.get(kind).copied().unwrap_or(0);
            let b = other.shapes.get(kind).copied().unwrap_or(0);
            diff += a.abs_diff(b);
            total += a + b;
        }
        let shape_distance = if total == 0 {
            0.0
        } else {
            diff as f64 / total as f64
        };

        0.6 * key_distance + 0.4 * shape_distance
    }
}

pub(crate) fn diverging_fields(base: Option<&Payload>, local: &Payload, remote: &Payload) -> Vec<FieldConflict> {
    let keys: BTreeSet<&String> = local
        .keys()
        .chain(remote.keys())
        .chain(base.into_iter().flat_map(|b| b.keys()))
        .collect();

    keys.into_iter()
        .filter_map(|key| {
            let l = local.get(key.as_str());
            let r = remote.get(key.as_str());
            if l == r {
                return None;
            }

            let b = base.map(|b| b.get(key.as_str()));
            let change = match b {
                Some(b) if l == b => FieldChange::RemoteOnly,
                Some(b) if r == b => FieldChange::LocalOnly,
                _ => FieldChange::Both,
            };

            Some(FieldConflict {
                field: key.clone(),
                base: b.flatten().cloned(),
                local: l.cloned(),
                remote: r.cloned(),
                change,
            })
        })
        .collect()
}
