//! CLI command implementations.
//!
//! Each command returns its result as a JSON value; `main` prints it.

pub mod apply;
pub mod diff;
pub mod interval;
pub mod merge;
pub mod simulate;

use driftsync_core::{payload_from_value, Payload};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;

/// Command result.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Reads a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> CommandResult<T> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let value = serde_json::from_str(&text).map_err(|e| format!("Invalid JSON in {}: {}", path.display(), e))?;
    Ok(value)
}

/// Reads a JSON object as a payload.
pub fn read_payload(path: &Path) -> CommandResult<Payload> {
    let value = read_json::<Value>(path)?;
    payload_from_value(value).map_err(|e| format!("{}: {}", path.display(), e).into())
}

/// Prints a JSON value to stdout.
pub fn print_json(value: &Value, pretty: bool) -> CommandResult<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_testkit::TempFiles;
    use serde_json::json;

    #[test]
    fn read_payload_requires_an_object() {
        let files = TempFiles::new();
        let ok = files.write_json("ok.json", &json!({"a": 1}));
        let bad = files.write_json("bad.json", &json!([1, 2]));
        let broken = files.write_text("broken.json", "{not json");

        assert_eq!(read_payload(&ok).unwrap().len(), 1);
        let err = read_payload(&bad).unwrap_err().to_string();
        assert!(err.contains("an array"), "{err}");
        let err = read_payload(&broken).unwrap_err().to_string();
        assert!(err.contains("Invalid JSON"), "{err}");
        assert!(read_payload(&files.file("missing.json")).is_err());
    }
}
