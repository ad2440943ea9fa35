//! Flat persistent key-value store.
//!
//! A [`FlatStore`] is a single JSON document on disk mapping string keys to
//! string values, with a hard quota on total size. Several consumers share
//! one store by prefixing their keys with a namespace: the cache writes
//! under [`CACHE_NAMESPACE`], the rate limiter under [`RATE_NAMESPACE`].
//!
//! Every mutation is persisted before the lock is released (write to a
//! sibling temp file, then rename), so a crash leaves either the old or the
//! new document.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rampart_core::StorageError;

use super::StorageBackend;

/// Key prefix for cache entries.
pub const CACHE_NAMESPACE: &str = "cache_";

/// Key prefix for rate-limit timestamp logs.
pub const RATE_NAMESPACE: &str = "rate_";

#[derive(Debug)]
struct FlatState {
    entries: BTreeMap<String, String>,
    used_bytes: u64,
}

impl FlatState {
    fn footprint(key: &str, value: &str) -> u64 {
        (key.len() + value.len()) as u64
    }
}

/// Quota-limited string map, optionally backed by a file.
#[derive(Debug)]
pub struct FlatStore {
    path: Option<PathBuf>,
    quota_bytes: u64,
    state: Mutex<FlatState>,
}

impl FlatStore {
    /// Open (or create) the store at `path`.
    ///
    /// An unreadable or corrupt document is logged and replaced by an empty
    /// one; the next write overwrites it.
    pub fn open(path: impl AsRef<Path>, quota_bytes: u64) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
        }

        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding corrupt flat store");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        let used_bytes = entries
            .iter()
            .map(|(k, v)| FlatState::footprint(k, v))
            .sum();

        Ok(Self {
            path: Some(path),
            quota_bytes,
            state: Mutex::new(FlatState {
                entries,
                used_bytes,
            }),
        })
    }

    /// Store that never touches the filesystem.
    pub fn in_memory(quota_bytes: u64) -> Self {
        Self {
            path: None,
            quota_bytes,
            state: Mutex::new(FlatState {
                entries: BTreeMap::new(),
                used_bytes: 0,
            }),
        }
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// Bytes currently counted against the quota.
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().map(|s| s.used_bytes).unwrap_or(0)
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        let state = self.lock()?;
        Ok(state.entries.get(&namespaced(namespace, key)).cloned())
    }

    /// Insert or replace a value.
    ///
    /// Fails with [`StorageError::QuotaExceeded`] when the document would
    /// grow past the quota; the store is left untouched in that case.
    pub fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let full_key = namespaced(namespace, key);
        let mut state = self.lock()?;

        let released = state
            .entries
            .get(&full_key)
            .map(|old| FlatState::footprint(&full_key, old))
            .unwrap_or(0);
        let needed = state.used_bytes - released + FlatState::footprint(&full_key, value);
        if needed > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                needed,
                quota: self.quota_bytes,
            });
        }

        let previous = state.entries.insert(full_key.clone(), value.to_string());
        let previous_used = state.used_bytes;
        state.used_bytes = needed;

        if let Err(e) = self.persist(&state) {
            match previous {
                Some(old) => state.entries.insert(full_key, old),
                None => state.entries.remove(&full_key),
            };
            state.used_bytes = previous_used;
            return Err(e);
        }
        Ok(())
    }

    pub fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let full_key = namespaced(namespace, key);
        let mut state = self.lock()?;
        if let Some(old) = state.entries.remove(&full_key) {
            let released = FlatState::footprint(&full_key, &old);
            state.used_bytes -= released;
            if let Err(e) = self.persist(&state) {
                state.entries.insert(full_key, old);
                state.used_bytes += released;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove `key` only while it still holds `expected`.
    pub fn remove_if(
        &self,
        namespace: &str,
        key: &str,
        expected: &str,
    ) -> Result<bool, StorageError> {
        let full_key = namespaced(namespace, key);
        let mut state = self.lock()?;
        if state.entries.get(&full_key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        let released = FlatState::footprint(&full_key, expected);
        state.entries.remove(&full_key);
        state.used_bytes -= released;
        if let Err(e) = self.persist(&state) {
            state.entries.insert(full_key, expected.to_string());
            state.used_bytes += released;
            return Err(e);
        }
        Ok(true)
    }

    /// Remove every key in `namespace`, leaving other namespaces alone.
    pub fn clear_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let doomed: Vec<String> = state
            .entries
            .range(namespace.to_string()..)
            .take_while(|(k, _)| k.starts_with(namespace))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        let previous_used = state.used_bytes;
        let mut removed = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some(old) = state.entries.remove(&key) {
                state.used_bytes -= FlatState::footprint(&key, &old);
                removed.push((key, old));
            }
        }
        if let Err(e) = self.persist(&state) {
            state.entries.extend(removed);
            state.used_bytes = previous_used;
            return Err(e);
        }
        Ok(())
    }

    /// All pairs in `namespace`, with the prefix stripped.
    pub fn entries(&self, namespace: &str) -> Result<Vec<(String, String)>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .range(namespace.to_string()..)
            .take_while(|(k, _)| k.starts_with(namespace))
            .map(|(k, v)| (k[namespace.len()..].to_string(), v.clone()))
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, FlatState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn persist(&self, state: &FlatState) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let document = serde_json::to_string(&state.entries).map_err(|e| {
            StorageError::Serialization {
                key: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, document).map_err(|e| StorageError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
    }
}

fn namespaced(namespace: &str, key: &str) -> String {
    format!("{namespace}{key}")
}

// ============================================================================
// CACHE BACKEND VIEW
// ============================================================================

/// Cache backend over the `cache_` namespace of a shared [`FlatStore`].
#[derive(Debug, Clone)]
pub struct FlatBackend {
    store: Arc<FlatStore>,
}

impl FlatBackend {
    pub fn new(store: Arc<FlatStore>) -> Self {
        Self { store }
    }

    /// The underlying store, for sharing with other namespaces.
    pub fn store(&self) -> &Arc<FlatStore> {
        &self.store
    }
}

#[async_trait]
impl StorageBackend for FlatBackend {
    fn kind(&self) -> &'static str {
        "flat"
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.store.get(CACHE_NAMESPACE, key)
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.store.set(CACHE_NAMESPACE, key, value)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.store.remove(CACHE_NAMESPACE, key)
    }

    async fn remove_if_unchanged(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        self.store.remove_if(CACHE_NAMESPACE, key, expected)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.store.clear_namespace(CACHE_NAMESPACE)
    }

    async fn read_all(&self) -> Result<Vec<(String, String)>, StorageError> {
        self.store.entries(CACHE_NAMESPACE)
    }
}
