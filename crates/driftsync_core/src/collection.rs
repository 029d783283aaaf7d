//! Collection-level deltas.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::checksum::checksum;
use crate::delta::{calculate_delta, DeltaPatch};
use crate::record::{Payload, RecordId};

/// Create, update and delete sets between two versions of a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionDelta {
    /// Records present only in the new collection, in new order.
    pub created: Vec<(RecordId, Payload)>,
    /// Records present in both with different content, in new order.
    pub updated: Vec<(RecordId, DeltaPatch)>,
    /// Records present only in the old collection, in old order.
    pub deleted: Vec<RecordId>,
}

impl CollectionDelta {
    /// Returns true if the two collections are identical.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of changed records.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Compares two collections of `(id, payload)` pairs.
///
/// If an id appears more than once in one input, its last occurrence wins.
pub fn calculate_collection_delta(
    old: &[(RecordId, Payload)],
    new: &[(RecordId, Payload)],
) -> CollectionDelta {
    let old_index: HashMap<&str, &Payload> =
        old.iter().map(|(id, payload)| (id.as_str(), payload)).collect();
    let new_index: HashMap<&str, &Payload> =
        new.iter().map(|(id, payload)| (id.as_str(), payload)).collect();

    let mut delta = CollectionDelta::default();
    let mut seen = HashSet::new();

    for (id, _) in new {
        if !seen.insert(id.as_str()) {
            continue;
        }
        let current = new_index[id.as_str()];
        match old_index.get(id.as_str()) {
            None => delta.created.push((id.clone(), current.clone())),
            Some(previous) => {
                if checksum(previous) != checksum(current) {
                    delta.updated.push((id.clone(), calculate_delta(previous, current)));
                }
            }
        }
    }

    seen.clear();
    for (id, _) in old {
        if !seen.insert(id.as_str()) {
            continue;
        }
        if !new_index.contains_key(id.as_str()) {
            delta.deleted.push(id.clone());
        }
    }

    delta
}
