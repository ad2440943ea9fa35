//! RAMPART Storage - Cache Store and Backends
//!
//! A TTL cache store over three interchangeable backends (memory, flat
//! key-value file, LMDB), plus the cache-first and network-first
//! strategies built on it.

pub mod backend;
pub mod cache;

pub use backend::{
    open_backend, FlatBackend, FlatStore, LmdbBackend, MemoryBackend, StorageBackend,
    CACHE_NAMESPACE, RATE_NAMESPACE,
};
pub use cache::{
    CacheEntry, CacheRead, CacheStats, CacheStore, ResilientCache, ServedFrom, STALE_NOTICE,
};
