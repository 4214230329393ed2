//! In-memory tier. Always available unless a capacity limit is hit.
//!
//! The session manager keeps one of these as its last-resort tier; tests
//! share one between managers to stand in for storage common to several
//! contexts.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StorageError;
use crate::storage::KeyValueStore;

/// Mutex-guarded string map.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    entries: Mutex<HashMap<String, String>>,
    /// Maximum number of distinct keys; writes of new keys beyond it fail.
    capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            capacity: None,
        }
    }

    /// A store that refuses new keys once `capacity` keys are held.
    pub fn with_capacity_limit(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(name)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.entries.lock().map_err(|_| StorageError::Unavailable {
            tier: self.name.clone(),
            reason: "lock poisoned".to_string(),
        })
    }
}

impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.lock()?;
        if let Some(limit) = self.capacity
            && !entries.contains_key(key)
            && entries.len() >= limit
        {
            return Err(StorageError::QuotaExceeded {
                tier: self.name.clone(),
            });
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
