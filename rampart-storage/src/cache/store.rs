//! TTL cache store over a pluggable backend.
//!
//! The store owns expiry, fingerprints, eviction and statistics; the backend
//! only keeps strings. Storage failures never reach callers: reads degrade
//! to a miss, writes to a no-op, and both are logged at `warn`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rampart_core::{
    elapsed_between, CacheSettings, SharedClock, StorageError, SystemClock, Timestamp,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::entry::{CacheEntry, EntryMeta};
use super::freshness::CacheRead;
use crate::backend::{open_backend, StorageBackend};

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries in the cache.
    pub entry_count: u64,
    /// Key plus serialized value bytes.
    pub memory_bytes: u64,
    /// Age of the oldest entry, if any.
    pub oldest_entry_age: Option<Duration>,
    /// Entries removed by the capacity check.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Key/value store with TTL.
pub struct CacheStore {
    backend: Arc<dyn StorageBackend>,
    default_expiry: Duration,
    max_entries: usize,
    clock: SharedClock,
    counters: RwLock<Counters>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.kind())
            .field("default_expiry", &self.default_expiry)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl CacheStore {
    /// Build a store with the backend named in `settings` and the system clock.
    pub fn create(settings: &CacheSettings) -> Result<Self, StorageError> {
        let backend = open_backend(&settings.backend)?;
        Ok(Self::with_backend(backend, settings, Arc::new(SystemClock)))
    }

    /// Build a store over an existing backend.
    pub fn with_backend(
        backend: Arc<dyn StorageBackend>,
        settings: &CacheSettings,
        clock: SharedClock,
    ) -> Self {
        tracing::debug!(
            kind = backend.kind(),
            max_entries = settings.max_entries,
            default_expiry_ms = settings.default_expiry_ms,
            "cache store created"
        );
        Self {
            backend,
            default_expiry: settings.default_expiry(),
            max_entries: settings.max_entries,
            clock,
            counters: RwLock::new(Counters::default()),
        }
    }

    /// Flush the backend and drop the store.
    pub async fn dispose(self) {
        if let Err(e) = self.backend.flush().await {
            tracing::warn!(kind = self.backend.kind(), error = %e, "cache flush failed on dispose");
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Value for `key` if present and unexpired.
    ///
    /// Expired or unreadable entries are removed on the way out.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(raw) = self.read_raw(key).await else {
            self.record_lookup(false);
            return None;
        };

        let now = self.clock.now();
        match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) if !entry.is_expired_at(now) => {
                self.record_lookup(true);
                Some(entry.data)
            }
            Ok(_) => {
                tracing::debug!(key, "cache entry expired");
                self.discard(key, &raw).await;
                self.record_lookup(false);
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "unreadable cache entry");
                self.discard(key, &raw).await;
                self.record_lookup(false);
                None
            }
        }
    }

    /// Read without lazy deletion or stats, expired entries included.
    pub async fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<CacheRead<T>> {
        let raw = self.read_raw(key).await?;
        match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) => Some(CacheRead::from_entry(entry, self.clock.now())),
            Err(e) => {
                tracing::warn!(key, error = %e, "unreadable cache entry");
                None
            }
        }
    }

    /// Store `data` for `ttl` (or the default expiry).
    pub async fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) {
        self.write_entry(key, data, ttl).await;
    }

    /// Write an entry and return its header, or `None` if nothing was stored.
    pub(crate) async fn write_entry<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        ttl: Option<Duration>,
    ) -> Option<EntryMeta> {
        let ttl = ttl.unwrap_or(self.default_expiry);
        let entry = match CacheEntry::new(data, self.clock.now(), ttl) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache value not serializable");
                return None;
            }
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache entry not serializable");
                return None;
            }
        };

        let mut result = self.backend.write(key, &raw).await;
        if matches!(&result, Err(e) if e.is_quota()) {
            let purged = self.purge_expired().await;
            tracing::debug!(key, purged, "cache quota hit; retrying after purge");
            result = self.backend.write(key, &raw).await;
        }
        if let Err(e) = result {
            tracing::warn!(key, kind = self.backend.kind(), error = %e, "cache write dropped");
            return None;
        }

        self.enforce_capacity(key).await;
        Some(entry.meta())
    }

    /// True iff an unexpired entry exists.
    pub async fn has(&self, key: &str) -> bool {
        let Some(raw) = self.read_raw(key).await else {
            return false;
        };
        match EntryMeta::parse(&raw) {
            Ok(meta) if !meta.is_expired_at(self.clock.now()) => true,
            _ => {
                self.discard(key, &raw).await;
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.backend.remove(key).await {
            tracing::warn!(key, kind = self.backend.kind(), error = %e, "cache delete failed");
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.backend.clear().await {
            tracing::warn!(kind = self.backend.kind(), error = %e, "cache clear failed");
        }
    }

    /// Fingerprint of the unexpired entry under `key`.
    pub async fn fingerprint(&self, key: &str) -> Option<String> {
        let raw = self.read_raw(key).await?;
        EntryMeta::parse(&raw)
            .ok()
            .filter(|meta| !meta.is_expired_at(self.clock.now()))
            .map(|meta| meta.fingerprint)
    }

    /// Remove every expired or unreadable entry; returns how many went.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        for (key, raw) in self.snapshot().await {
            let expired = EntryMeta::parse(&raw).map_or(true, |meta| meta.is_expired_at(now));
            if expired && self.discard(&key, &raw).await {
                purged += 1;
            }
        }
        purged
    }

    /// Best-effort statistics.
    pub async fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let entries = self.snapshot().await;

        let memory_bytes = entries
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum();
        let oldest_entry_age = entries
            .iter()
            .filter_map(|(_, raw)| EntryMeta::parse(raw).ok())
            .map(|meta| meta.created_at)
            .min()
            .map(|oldest| elapsed_between(now, oldest));

        let mut stats = CacheStats {
            entry_count: entries.len() as u64,
            memory_bytes,
            oldest_entry_age,
            ..CacheStats::default()
        };
        if let Ok(counters) = self.counters.read() {
            stats.hits = counters.hits;
            stats.misses = counters.misses;
            stats.evictions = counters.evictions;
        }
        stats
    }

    pub(crate) fn record_lookup(&self, hit: bool) {
        if let Ok(mut counters) = self.counters.write() {
            if hit {
                counters.hits += 1;
            } else {
                counters.misses += 1;
            }
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn read_raw(&self, key: &str) -> Option<String> {
        match self.backend.read(key).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, kind = self.backend.kind(), error = %e, "cache read failed");
                None
            }
        }
    }

    async fn snapshot(&self) -> Vec<(String, String)> {
        self.backend.read_all().await.unwrap_or_else(|e| {
            tracing::warn!(kind = self.backend.kind(), error = %e, "cache scan failed");
            Vec::new()
        })
    }

    /// Remove `key` if it still holds `raw`.
    async fn discard(&self, key: &str, raw: &str) -> bool {
        match self.backend.remove_if_unchanged(key, raw).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(key, kind = self.backend.kind(), error = %e, "cache removal failed");
                false
            }
        }
    }

    /// Bring the entry count back under `max_entries`.
    ///
    /// Expired entries go first, then the oldest by creation time, ties broken
    /// by key. `written` is never a candidate. Only runs for backends that do
    /// not bound themselves.
    async fn enforce_capacity(&self, written: &str) {
        if self.backend.manages_own_capacity() {
            return;
        }
        let entries = self.snapshot().await;
        if entries.len() <= self.max_entries {
            return;
        }

        let now = self.clock.now();
        let mut evicted = 0u64;
        let mut live = Vec::with_capacity(entries.len());
        let mut holds_written = false;
        for (key, raw) in entries {
            if key == written {
                holds_written = true;
                continue;
            }
            match EntryMeta::parse(&raw) {
                Ok(meta) if !meta.is_expired_at(now) => live.push((meta.created_at, key, raw)),
                _ => {
                    if self.discard(&key, &raw).await {
                        evicted += 1;
                    }
                }
            }
        }

        let room = self.max_entries.saturating_sub(usize::from(holds_written));
        if live.len() > room {
            live.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            let excess = live.len() - room;
            for (_, key, raw) in live.into_iter().take(excess) {
                if self.discard(&key, &raw).await {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            tracing::debug!(evicted, max_entries = self.max_entries, "cache evicted entries");
            if let Ok(mut counters) = self.counters.write() {
                counters.evictions += evicted;
            }
        }
    }
}
