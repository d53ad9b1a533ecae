//! Key-value persistence for workflow state.
//!
//! The engine treats persistence as an opaque JSON key-value store so the
//! backing medium (a state file here, browser storage in the original
//! deployment) stays swappable.

use crate::error::{Result, TabflowError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Opaque JSON key-value store.
pub trait StorageBackend: Send + Sync {
    /// Fetch the values for `keys`. Missing keys are absent from the map.
    fn get(&self, keys: &[&str]) -> Result<HashMap<String, serde_json::Value>>;

    /// Merge `entries` into the store.
    fn set(&self, entries: HashMap<String, serde_json::Value>) -> Result<()>;

    /// Remove `keys` from the store.
    fn remove(&self, keys: &[&str]) -> Result<()>;
}

/// File-backed store: one JSON object per file, written atomically.
pub struct FileStorage {
    path: PathBuf,
    cache: Mutex<HashMap<String, serde_json::Value>>,
}

impl FileStorage {
    pub fn new(path: PathBuf) -> Result<Self> {
        let cache = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| TabflowError::Storage(format!("corrupt state file {:?}: {}", path, e)))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn flush(&self, snapshot: &HashMap<String, serde_json::Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, keys: &[&str]) -> Result<HashMap<String, serde_json::Value>> {
        let cache = self.cache.lock();
        Ok(keys
            .iter()
            .filter_map(|k| cache.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    fn set(&self, entries: HashMap<String, serde_json::Value>) -> Result<()> {
        let mut cache = self.cache.lock();
        cache.extend(entries);
        self.flush(&cache)
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut cache = self.cache.lock();
        for key in keys {
            cache.remove(*key);
        }
        self.flush(&cache)
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, keys: &[&str]) -> Result<HashMap<String, serde_json::Value>> {
        let entries = self.entries.lock();
        Ok(keys
            .iter()
            .filter_map(|k| entries.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    fn set(&self, new_entries: HashMap<String, serde_json::Value>) -> Result<()> {
        self.entries.lock().extend(new_entries);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}
