//! Local store adapter
//!
//! The local store is the per-device source of truth: every screen reads its
//! state from here at startup and writes edits straight back. Sync only ever
//! touches the synced keys.
//!
//! Storage location: `<data_dir>/local_store.json` (configurable via `Config`)

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::payload::SyncedPayload;

/// Synchronous string key-value storage
pub trait LocalStore: Send + Sync {
    /// Read a value; `None` if the key was never written
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    /// Write a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    /// Snapshot the given keys (absent keys are left out)
    fn snapshot(&self, keys: &[String]) -> SyncResult<SyncedPayload> {
        let mut payload = SyncedPayload::new();
        for key in keys {
            if let Some(value) = self.get(key)? {
                payload.insert(key.clone(), value);
            }
        }
        Ok(payload)
    }
}

/// Local store backed by a single JSON object file
///
/// The file is re-read on every access so writes made by other processes
/// are always visible.
pub struct FileLocalStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileLocalStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// All entries, synced or not
    pub fn entries(&self) -> SyncResult<BTreeMap<String, String>> {
        self.load()
    }

    fn load(&self) -> SyncResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let content =
            fs::read_to_string(&self.path).map_err(|e| SyncError::from_io(e, self.path.clone()))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&content).map_err(|e| SyncError::LocalStore {
            path: self.path.clone(),
            details: format!("invalid JSON: {}", e),
        })
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());

        let json = serde_json::to_vec_pretty(&entries)?;
        atomic_write(&self.path, &json).map_err(|e| SyncError::from_io(e, self.path.clone()))
    }
}

/// In-process local store
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<K: Into<String>, V: Into<String>>(
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    fs::rename(&temp_path, path)
}
