//! Test fixtures.
//!
//! Provides an orchestrator wired to the mock backend and an in-memory
//! replica, plus temporary-file helpers for tools that read JSON documents.

use driftsync_core::{Payload, Record};
use driftsync_engine::{
    EngineConfig, EntityConfig, MemoryReplica, MockAdapter, Orchestrator, ProcessReport,
};
use driftsync_queue::{QueueConfig, RetryConfig};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Converts a JSON object literal into a payload.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture payload must be an object, got {other}"),
    }
}

/// Engine configuration whose retries are immediate.
pub fn fast_retry_config(max_attempts: u32) -> EngineConfig {
    EngineConfig::default().with_queue(
        QueueConfig::default().with_retry(
            RetryConfig::new(max_attempts)
                .with_base_delay(Duration::ZERO)
                .with_jitter_ratio(0.0),
        ),
    )
}

/// An orchestrator wired to a connected mock backend.
pub struct SyncHarness {
    /// The orchestrator.
    pub engine: Orchestrator,
    /// The mock backend.
    pub adapter: Arc<MockAdapter>,
    /// The local replica.
    pub replica: Arc<MemoryReplica>,
}

impl SyncHarness {
    /// Creates a harness with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates a harness with `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_adapter(config, MockAdapter::new())
    }

    /// Creates a harness around a preconfigured mock backend.
    pub fn with_adapter(config: EngineConfig, adapter: MockAdapter) -> Self {
        let adapter = Arc::new(adapter);
        adapter.set_connected(true);
        let replica = Arc::new(MemoryReplica::new());
        let engine = Orchestrator::new(config, adapter.clone(), replica.clone());
        Self {
            engine,
            adapter,
            replica,
        }
    }

    /// Registers an entity.
    pub fn register(&self, name: &str, config: EntityConfig) {
        self.engine
            .register_entity(name, config)
            .expect("Failed to register entity");
    }

    /// Applies a local edit.
    pub fn edit(&self, collection: &str, id: &str, fields: Value) -> Record {
        self.replica.upsert_local(collection, id, payload(fields))
    }

    /// Creates a record locally and pushes it.
    pub async fn seed(&self, collection: &str, id: &str, fields: Value) {
        self.edit(collection, id, fields);
        self.engine
            .enqueue_record(collection, id)
            .expect("Failed to enqueue seed record");
        let report = self
            .engine
            .process_pending()
            .await
            .expect("Failed to process seed record");
        assert_eq!(report.completed, 1, "seed record {collection}/{id} did not sync");
    }

    /// Enqueues dirty records of every entity and processes the queue.
    pub async fn sync(&self) -> ProcessReport {
        for entity in self.engine.entities() {
            self.engine.sync_dirty(&entity).expect("Failed to enqueue dirty records");
        }
        self.engine
            .process_pending()
            .await
            .expect("Failed to process queue")
    }
}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// A temporary directory of JSON documents, removed on drop.
pub struct TempFiles {
    dir: TempDir,
}

impl TempFiles {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of `name` inside the directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Writes `value` as pretty JSON.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> PathBuf {
        let text = serde_json::to_string_pretty(value).expect("Failed to encode JSON");
        self.write_text(name, &text)
    }

    /// Writes raw text.
    pub fn write_text(&self, name: &str, text: &str) -> PathBuf {
        let path = self.file(name);
        std::fs::write(&path, text).expect("Failed to write fixture file");
        path
    }

    /// Reads a JSON document.
    pub fn read_json(&self, name: &str) -> Value {
        let text = std::fs::read_to_string(self.file(name)).expect("Failed to read fixture file");
        serde_json::from_str(&text).expect("Fixture file is not JSON")
    }
}

impl Default for TempFiles {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn temp_files_round_trip() {
        let files = TempFiles::new();
        let path = files.write_json("doc.json", &json!({"a": 1}));
        assert!(path.exists());
        assert_eq!(files.read_json("doc.json"), json!({"a": 1}));
    }

    #[tokio::test]
    async fn harness_seeds_and_syncs() {
        let harness = SyncHarness::new();
        harness.register("notes", EntityConfig::default());
        harness.seed("notes", "n1", json!({"title": "a"})).await;
        assert!(harness.adapter.stored("notes", "n1").is_some());

        harness.edit("notes", "n1", json!({"title": "b"}));
        harness.edit("notes", "n2", json!({"title": "c"}));
        let report = harness.sync().await;
        assert_eq!(report.completed, 2);
    }
}
