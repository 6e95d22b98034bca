//! Flat string key-value stores standing in for browser storage.
//!
//! SYSTEM CONTEXT
//! ==============
//! `FileStore` plays the role of local storage: it survives a client restart
//! and a process restart. `MemoryStore` plays the role of session storage and
//! lives as long as the process. Both sit behind [`KeyValueStore`] so auth
//! and the synchronizer never know which one they hold.
//!
//! TRADE-OFFS
//! ==========
//! `FileStore` rewrites the whole map on every mutation. The store holds a
//! handful of short strings, so simplicity wins over incremental writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use flags::SdkLogLevel;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Local-storage key of the persisted SDK log level.
pub const SDK_LOG_LEVEL_KEY: &str = "ld-sdk-log-level";
/// Local-storage key of the persisted logged-in user.
pub const USER_KEY: &str = "demoUser";
/// Session-storage key of the one-shot logout message.
pub const LOGOUT_MESSAGE_KEY: &str = "logoutMessage";
/// File name of the local store inside the data directory.
pub const LOCAL_STORAGE_FILE: &str = "local_storage.json";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A flat string map.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// # Errors
    ///
    /// Returns a [`StorageError`] when the backing medium cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] when the backing medium cannot be written.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Process-lifetime store (session storage).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// JSON-file-backed store (local storage).
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, creating parent directories as needed.
    ///
    /// A missing file is an empty store. A file that is not a JSON string
    /// map is discarded with a warning rather than blocking startup.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created or the
    /// file cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "local storage file unreadable; starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = entries.len(), "local storage opened");

        Ok(Self { path, entries: Mutex::new(entries) })
    }

    /// Open `local_storage.json` inside `dir`.
    ///
    /// # Errors
    ///
    /// Same as [`FileStore::open`].
    pub fn in_dir(dir: &Path) -> Result<Self, StorageError> {
        Self::open(dir.join(LOCAL_STORAGE_FILE))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let raw = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// The in-memory map only changes once the new contents are on disk.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = entries.clone();
        next.insert(key.to_owned(), value.to_owned());
        self.flush(&next)?;
        *entries = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.flush(&next)?;
        *entries = next;
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Load a JSON value stored under `key`. Absent or malformed entries read as `None`.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = store.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "stored value is not valid JSON; ignoring");
            None
        }
    }
}

/// Save `value` as JSON under `key`.
///
/// # Errors
///
/// Returns a [`StorageError`] if encoding or the write fails.
pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

/// The persisted SDK log level, or `info` when absent or invalid.
pub fn stored_sdk_log_level(store: &dyn KeyValueStore) -> SdkLogLevel {
    store
        .get(SDK_LOG_LEVEL_KEY)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default()
}

/// Persist `raw` as the SDK log level if it is one of the accepted values.
///
/// Returns `Ok(false)` without writing when `raw` is out of domain.
///
/// # Errors
///
/// Returns a [`StorageError`] if the write fails.
pub fn store_sdk_log_level(store: &dyn KeyValueStore, raw: &str) -> Result<bool, StorageError> {
    match raw.parse::<SdkLogLevel>() {
        Ok(level) => {
            store.set(SDK_LOG_LEVEL_KEY, level.as_str())?;
            Ok(true)
        }
        Err(e) => {
            warn!(error = %e, "refusing to persist SDK log level");
            Ok(false)
        }
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod tests;
