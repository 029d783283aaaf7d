//! Diff command implementation.

use driftsync_core::calculate_delta;
use serde_json::Value;
use std::path::Path;

use super::{read_payload, CommandResult};

/// Runs the diff command, returning the patch.
pub fn run(old: &Path, new: &Path) -> CommandResult<Value> {
    let old = read_payload(old)?;
    let new = read_payload(new)?;
    let patch = calculate_delta(&old, &new);
    tracing::debug!(
        changed = patch.changed_field_count(),
        deleted = patch.deletions.len(),
        "computed patch"
    );
    Ok(serde_json::to_value(patch)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_testkit::TempFiles;
    use serde_json::json;

    #[test]
    fn diff_lists_changes_and_deletions() {
        let files = TempFiles::new();
        let old = files.write_json("old.json", &json!({"name": "A", "value": 1, "tag": "x"}));
        let new = files.write_json("new.json", &json!({"name": "A", "value": 2}));

        let patch = run(&old, &new).unwrap();
        assert_eq!(patch["changes"], json!({"value": 2}));
        assert_eq!(patch["deletions"], json!(["tag"]));
        assert_eq!(patch["source_checksum"].as_str().unwrap().len(), 64);
    }
}
