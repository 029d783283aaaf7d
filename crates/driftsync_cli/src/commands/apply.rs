//! Apply command implementation.

use driftsync_core::{apply_delta, DeltaPatch};
use serde_json::Value;
use std::path::Path;

use super::{read_json, read_payload, CommandResult};

/// Runs the apply command, returning the patched object.
pub fn run(base: &Path, patch: &Path, verify: bool) -> CommandResult<Value> {
    let base = read_payload(base)?;
    let patch: DeltaPatch = read_json(patch)?;
    if !verify {
        tracing::warn!("checksum validation disabled");
    }
    let result = apply_delta(&base, &patch, verify)?;
    Ok(Value::Object(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::diff;
    use driftsync_testkit::TempFiles;
    use serde_json::json;

    #[test]
    fn applies_a_patch_from_diff() {
        let files = TempFiles::new();
        let old = files.write_json("old.json", &json!({"name": "A", "value": 1, "tag": "x"}));
        let new = files.write_json("new.json", &json!({"name": "A", "value": 2}));
        let patch = diff::run(&old, &new).unwrap();
        let patch = files.write_json("patch.json", &patch);

        assert_eq!(run(&old, &patch, true).unwrap(), json!({"name": "A", "value": 2}));
    }

    #[test]
    fn wrong_base_is_rejected_unless_unverified() {
        let files = TempFiles::new();
        let old = files.write_json("old.json", &json!({"value": 1}));
        let new = files.write_json("new.json", &json!({"value": 2}));
        let other = files.write_json("other.json", &json!({"value": 7, "extra": true}));
        let patch = diff::run(&old, &new).unwrap();
        let patch = files.write_json("patch.json", &patch);

        let err = run(&other, &patch, true).unwrap_err().to_string();
        assert!(err.contains("checksum"), "{err}");
        assert_eq!(run(&other, &patch, false).unwrap(), json!({"value": 2, "extra": true}));
    }
}
