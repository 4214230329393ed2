//! File-backed tier: a JSON object of string keys and values.
//!
//! Used for both the durable tier (`<data_dir>/session.json`) and the
//! session-scoped tier (under the runtime directory, which the OS clears at
//! logout or reboot).
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a crash mid-write never leaves a truncated file behind. The
//! read-modify-write cycle itself is not locked across processes.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::error::StorageError;
use crate::storage::KeyValueStore;

/// JSON-file key-value store.
#[derive(Debug, Clone)]
pub struct FileStore {
    name: String,
    path: PathBuf,
}

impl FileStore {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> StorageError {
        StorageError::Unavailable {
            tier: self.name.clone(),
            reason: format!("{}: {reason}", self.path.display()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.unavailable(e)),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
            tier: self.name.clone(),
            detail: format!("{}: {e}", self.path.display()),
        })
    }

    /// Load for a write; a corrupt file is replaced rather than blocking the tier.
    fn load_for_write(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match self.load() {
            Err(StorageError::Corrupt { detail, .. }) => {
                warn!(tier = %self.name, %detail, "discarding corrupt storage file");
                Ok(BTreeMap::new())
            }
            other => other,
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| self.unavailable(e))?;

        let content = serde_json::to_vec_pretty(entries).map_err(|e| self.unavailable(e))?;
        let temp_path = parent.join(format!(
            ".docchat-tmp-{}",
            uuid::Uuid::new_v4().as_hyphenated()
        ));

        let write_result = (|| -> Result<(), std::io::Error> {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&content)?;
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(classify_write_error(&self.name, &self.path, e));
        }

        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(classify_write_error(&self.name, &self.path, e));
        }

        trace!(tier = %self.name, path = %self.path.display(), keys = entries.len(), "storage file written");
        Ok(())
    }
}

/// Map a full disk to `QuotaExceeded`, everything else to `Unavailable`.
fn classify_write_error(tier: &str, path: &Path, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::StorageFull {
        StorageError::QuotaExceeded {
            tier: tier.to_string(),
        }
    } else {
        StorageError::Unavailable {
            tier: tier.to_string(),
            reason: format!("{}: {e}", path.display()),
        }
    }
}

impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.load_for_write()?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.load_for_write()?;
        if entries.remove(key).is_none() {
            return Ok(());
        }
        debug!(tier = %self.name, key, "removing storage key");
        self.save(&entries)
    }
}
