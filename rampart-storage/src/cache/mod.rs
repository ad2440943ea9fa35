//! Cache layer: TTL store, entries, and resilience strategies.
//!
//! Staleness is explicit. Reads through [`CacheStore::peek`] and the
//! strategies return [`CacheRead<T>`], which records when the value was
//! cached, when it expires, and whether it came from the cache, the
//! network, or a stale fallback.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(CacheStore::create(&config.cache)?);
//! let cache = ResilientCache::new(store, Arc::new(TracingNotifier));
//!
//! let read = cache
//!     .cache_first("events", || api.list_events(), None)
//!     .await?;
//! if read.is_stale() {
//!     tracing::info!(age_ms = read.age().as_millis() as u64, "showing saved events");
//! }
//! ```

pub mod entry;
pub mod freshness;
pub mod store;
pub mod strategy;

pub use entry::{CacheEntry, EntryMeta, MIN_TTL};
pub use freshness::{CacheRead, ServedFrom};
pub use store::{CacheStats, CacheStore};
pub use strategy::{ResilientCache, STALE_NOTICE};
