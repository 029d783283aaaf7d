//! Merge command implementation.

use clap::ValueEnum;
use driftsync_conflict::{ConflictCase, ConflictStrategy, ResolverConfig, ResolverRegistry};
use serde_json::Value;
use std::path::Path;

use super::{read_payload, CommandResult};

/// Resolution strategy selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// Field-level three-way merge
    FieldMerge,
    /// Later record timestamp wins
    LastWriteWins,
    /// Local version wins
    LocalWins,
    /// Remote version wins
    RemoteWins,
    /// Always defer to an operator
    Manual,
}

impl From<StrategyArg> for ConflictStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::FieldMerge => ConflictStrategy::FieldMerge,
            StrategyArg::LastWriteWins => ConflictStrategy::LastWriteWins,
            StrategyArg::LocalWins => ConflictStrategy::LocalWins,
            StrategyArg::RemoteWins => ConflictStrategy::RemoteWins,
            StrategyArg::Manual => ConflictStrategy::Manual,
        }
    }
}

/// Runs the merge command, returning the resolution and the diverging fields.
pub fn run(
    local: &Path,
    remote: &Path,
    base: Option<&Path>,
    collection: &str,
    strategy: StrategyArg,
) -> CommandResult<Value> {
    let local = read_payload(local)?;
    let remote = read_payload(remote)?;
    let base = base.map(read_payload).transpose()?;

    let case = ConflictCase::new(collection, "cli", base, local, remote);
    let registry = ResolverRegistry::new(ResolverConfig::default());
    registry.set_strategy(collection, strategy.into());
    let resolution = registry.resolve(&case);
    tracing::debug!(
        action = ?resolution.action,
        confidence = resolution.confidence,
        fields = case.fields.len(),
        "resolved"
    );

    let mut output = serde_json::Map::new();
    output.insert("auto_resolved".into(), Value::Bool(resolution.is_auto_resolved()));
    output.insert("fields".into(), serde_json::to_value(&case.fields)?);
    output.insert("resolution".into(), serde_json::to_value(&resolution)?);
    Ok(Value::Object(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_testkit::TempFiles;
    use serde_json::json;

    fn write_case(files: &TempFiles, base: Value, local: Value, remote: Value) {
        files.write_json("base.json", &base);
        files.write_json("local.json", &local);
        files.write_json("remote.json", &remote);
    }

    #[test]
    fn field_merge_combines_disjoint_edits() {
        let files = TempFiles::new();
        write_case(
            &files,
            json!({"name": "A", "value": 1}),
            json!({"name": "A", "value": 2}),
            json!({"name": "B", "value": 1}),
        );
        let base = files.file("base.json");
        let output = run(
            &files.file("local.json"),
            &files.file("remote.json"),
            Some(&base),
            "items",
            StrategyArg::FieldMerge,
        )
        .unwrap();

        assert_eq!(output["auto_resolved"], json!(true));
        assert_eq!(output["resolution"]["merged"], json!({"name": "B", "value": 2}));
        assert_eq!(output["resolution"]["action"], json!("merged"));
    }

    #[test]
    fn manual_strategy_defers() {
        let files = TempFiles::new();
        write_case(&files, json!({"a": 1}), json!({"a": 2}), json!({"a": 3}));
        let output = run(
            &files.file("local.json"),
            &files.file("remote.json"),
            None,
            "items",
            StrategyArg::Manual,
        )
        .unwrap();

        assert_eq!(output["auto_resolved"], json!(false));
        assert_eq!(output["resolution"]["action"], json!("deferred_to_manual"));
    }
}
