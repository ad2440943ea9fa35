//! Storage backend trait and implementations.
//!
//! The cache store only ever talks to a [`StorageBackend`]. Backends deal in
//! opaque strings (serialized cache entries); they know nothing about TTLs
//! or eviction.
//!
//! Three implementations ship with the crate:
//! - [`MemoryBackend`]: process-lifetime map, bounded by the store
//! - [`FlatBackend`]: namespaced view over a quota-limited [`FlatStore`] file
//! - [`LmdbBackend`]: LMDB environment with a lazily created `cache` database
//!
//! All three expose the same data visibility: a value written is readable by
//! the next `read`, a removed key is gone for the next `read`.

pub mod flat;
pub mod lmdb;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use rampart_core::{BackendKind, StorageError};

pub use flat::{FlatBackend, FlatStore, CACHE_NAMESPACE, RATE_NAMESPACE};
pub use lmdb::{LmdbBackend, CACHE_DATABASE};
pub use memory::MemoryBackend;

/// Capability set every cache backend provides.
///
/// Implementations must be safe to share between tasks. Each method is a
/// single logical step: a reader never observes a half-written value.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    /// Whether the backend bounds its own size.
    ///
    /// The cache store only runs its entry-count eviction for backends that
    /// return `false`.
    fn manages_own_capacity(&self) -> bool {
        true
    }

    /// Read the raw value for `key`.
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` under `key`, replacing any previous value.
    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Remove `key` only if it still holds `expected`.
    ///
    /// Used for lazy expiry and eviction so a value written concurrently by
    /// another task is never thrown away. Returns whether a removal happened.
    async fn remove_if_unchanged(&self, key: &str, expected: &str) -> Result<bool, StorageError>;

    /// Remove every key.
    async fn clear(&self) -> Result<(), StorageError>;

    /// Snapshot of all key/value pairs.
    async fn read_all(&self) -> Result<Vec<(String, String)>, StorageError>;

    /// Push buffered state to durable storage.
    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Build the backend selected by `kind`.
pub fn open_backend(kind: &BackendKind) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match kind {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendKind::Flat { path, quota_bytes } => {
            let store = Arc::new(FlatStore::open(path, *quota_bytes)?);
            Ok(Arc::new(FlatBackend::new(store)))
        }
        BackendKind::Structured {
            path,
            app_name,
            map_size_mb,
        } => Ok(Arc::new(LmdbBackend::open(path, app_name, *map_size_mb)?)),
    }
}
