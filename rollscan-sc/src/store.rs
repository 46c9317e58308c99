//! Durable keyed state storage
//!
//! The tracker and the history ledger never touch the filesystem directly:
//! they receive a [`StateStore`] at construction and load/save through it.
//! Each key holds one JSON document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rollscan_common::fs::write_atomic;
use rollscan_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Ordered list of subject ids recorded for the active batch
pub const SCANNED_SUBJECTS_KEY: &str = "scannedSubjects";

/// Batch id the subject list belongs to
pub const ACTIVE_BATCH_KEY: &str = "activeBatch";

/// Accepted inline scans since the last history clear
pub const INLINE_COUNT_KEY: &str = "inlineScanCount";

/// Capped, newest-first history entries
pub const HISTORY_KEY: &str = "scanHistory";

/// Keyed durable storage of JSON documents
///
/// Writes must be durable when `write` returns.
pub trait StateStore: Send + Sync {
    /// Raw JSON for `key`, or None if never written / removed
    fn read(&self, key: &str) -> Result<Option<String>>;

    fn write(&self, key: &str, contents: &str) -> Result<()>;

    /// Removing an absent key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

/// Load and decode `key`
pub fn load_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.read(key)? {
        Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        None => Ok(None),
    }
}

/// Encode and persist `value` under `key`
pub fn save_json<T: Serialize + ?Sized>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let contents = serde_json::to_string(value)?;
    store.write(key, &contents)
}

/// One `<key>.json` file per key inside a data folder
#[derive(Debug, Clone)]
pub struct FileStore {
    folder: PathBuf,
}

impl FileStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        {
            return Err(Error::InvalidInput(format!("Invalid storage key: {:?}", key)));
        }
        Ok(self.folder.join(format!("{}.json", key)))
    }
}

impl StateStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, contents: &str) -> Result<()> {
        let path = self.path_for(key)?;
        write_atomic(&path, contents.as_bytes())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store for tests and `--ephemeral` runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Io(std::io::Error::other("memory store lock poisoned")))
    }
}

impl StateStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn write(&self, key: &str, contents: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
