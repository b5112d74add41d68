//! Durable key-value storage for tokens and account metadata.
//!
//! The whole store is a single JSON object in the application's private data
//! directory. It is read once when opened and rewritten wholesale on every
//! mutation:
//! - Unreadable or corrupt files open as an empty store
//! - Failed writes are logged and the in-memory copy stays authoritative
//! - Writes land in a temp file that is renamed over the target

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{CuratorError, Result};

/// JSON-file backed credential storage.
///
/// All methods take `&self`; the in-memory document and file writes are
/// serialized by one lock.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl CredentialStore {
    /// Opens the store at `path`, loading its current contents.
    ///
    /// Never fails: a missing file is an empty store, and a file that cannot
    /// be read or parsed is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = load_document(&path);
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the raw JSON value stored under `key`.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Returns the value under `key` deserialized as `T`.
    ///
    /// A value of the wrong shape reads as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, error = %e, "Ignoring malformed value in credential store");
                None
            },
        }
    }

    /// Checks whether `key` is present.
    pub fn has(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Lists all keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Stores `value` under `key` and persists the document.
    ///
    /// Persistence failures are logged; the value stays in memory.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = self.try_set(key, value) {
            tracing::warn!(
                key,
                error = %e,
                "Credential store write failed; keeping in-memory value"
            );
        }
    }

    /// Stores `value` under `key` and persists, reporting write failures.
    ///
    /// The in-memory value is updated even when the write fails.
    pub fn try_set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut data = self.lock();
        data.insert(key.to_string(), value);
        self.persist(&data)
    }

    /// Removes `key` and persists the document.
    pub fn delete(&self, key: &str) {
        if let Err(e) = self.try_delete(key) {
            tracing::warn!(key, error = %e, "Credential store write failed after delete");
        }
    }

    /// Removes `key` and persists, reporting write failures.
    pub fn try_delete(&self, key: &str) -> Result<()> {
        let mut data = self.lock();
        if data.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&data)
    }

    /// Removes every key and persists the empty document.
    pub fn clear(&self) {
        let mut data = self.lock();
        data.clear();
        if let Err(e) = self.persist(&data) {
            tracing::warn!(error = %e, "Credential store write failed after clear");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the document to a temp file next to the target, then renames it.
    fn persist(&self, data: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| cache_io(&self.path, &e))?;
            }
        }

        let json = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| cache_io(&tmp, &e))?;
        fs::rename(&tmp, &self.path).map_err(|e| cache_io(&self.path, &e))?;

        tracing::debug!(path = %self.path.display(), "Credential store saved");
        Ok(())
    }
}

fn cache_io(path: &Path, err: &std::io::Error) -> CuratorError {
    CuratorError::CacheIo(format!("{}: {err}", path.display()))
}

fn load_document(path: &Path) -> Map<String, Value> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No credential store yet, starting fresh");
            return Map::new();
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not read credential store; starting empty"
            );
            return Map::new();
        },
    };

    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => {
            tracing::debug!(path = %path.display(), keys = map.len(), "Credential store loaded");
            map
        },
        Ok(_) => {
            tracing::warn!(
                path = %path.display(),
                "Credential store is not a JSON object; starting empty"
            );
            Map::new()
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Credential store is corrupt; starting empty"
            );
            Map::new()
        },
    }
}
