//! Key/value persistence for operator-owned state.
//!
//! The control plane only persists the routing table, under one fixed key.
//! Values are opaque JSON to the store; the owning component decides the shape.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;

use crate::error::{Result, StageError};

/// Trait for persistence backends.
pub trait KeyValueStore: Send + Sync {
    /// Load the value stored under `key`, `None` if never saved.
    fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value.
    fn save(&self, key: &str, value: &Value) -> Result<()>;
}

/// One JSON file per key inside a state directory.
///
/// Writes go to a sibling temp file and are renamed into place so a crash
/// mid-write never leaves a truncated routing table behind.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            StageError::Persistence(format!("create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path)
            .map_err(|e| StageError::Persistence(format!("read {}: {}", path.display(), e)))?;
        let value = serde_json::from_str(&contents)
            .map_err(|e| StageError::Persistence(format!("parse {}: {}", path.display(), e)))?;
        Ok(Some(value))
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        let contents = serde_json::to_string_pretty(value)
            .map_err(|e| StageError::Persistence(format!("serialize {}: {}", key, e)))?;
        std::fs::write(&tmp, contents)
            .map_err(|e| StageError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| StageError::Persistence(format!("rename {}: {}", path.display(), e)))?;

        tracing::debug!(key, path = %path.display(), "persisted");
        Ok(())
    }
}

/// In-memory store, for tests and `--ephemeral` runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        let values = self
            .values
            .read()
            .map_err(|_| StageError::Persistence("store lock poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| StageError::Persistence("store lock poisoned".into()))?;
        values.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_round_trip() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path())?;

        assert_eq!(store.load("routing")?, None);

        let value = json!({"routes": {"video": {"sink": "hdmi"}}, "defaultSink": "hdmi"});
        store.save("routing", &value)?;

        // A fresh store over the same directory sees the saved blob
        let reopened = JsonFileStore::new(dir.path())?;
        assert_eq!(reopened.load("routing")?, Some(value));
        assert!(!dir.path().join("routing.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("routing.json"), "{not json").unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        assert!(matches!(store.load("routing"), Err(StageError::Persistence(_))));
    }

    #[test]
    fn test_memory_store() -> Result<()> {
        let store = MemoryStore::new();
        store.save("k", &json!(1))?;
        store.save("k", &json!(2))?;
        assert_eq!(store.load("k")?, Some(json!(2)));
        assert_eq!(store.load("other")?, None);
        Ok(())
    }
}
