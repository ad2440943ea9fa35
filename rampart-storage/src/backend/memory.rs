//! Process-lifetime backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use rampart_core::StorageError;

use super::StorageBackend;

/// In-memory backend. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn manages_own_capacity(&self) -> bool {
        false
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.remove(key);
        Ok(())
    }

    async fn remove_if_unchanged(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        if entries.get(key).map(String::as_str) == Some(expected) {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.clear();
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<(String, String)>, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
