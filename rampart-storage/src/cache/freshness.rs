//! Freshness metadata for cache reads.
//!
//! Every value handed back by the store's `peek` or by a resilience strategy
//! is wrapped in a [`CacheRead<T>`], so callers can tell whether they got a
//! live value, a cached one, or a stale fallback.

use std::time::Duration;

use rampart_core::{elapsed_between, Timestamp};

use super::entry::CacheEntry;

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServedFrom {
    /// Unexpired cache entry; the operation was not invoked.
    Cache,
    /// Fresh result of the operation.
    Network,
    /// Cached value served because the operation failed.
    Stale,
}

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: T,
    cached_at: Timestamp,
    expires_at: Timestamp,
    read_at: Timestamp,
    served_from: ServedFrom,
}

impl<T> CacheRead<T> {
    /// Wrap a stored entry as observed at `read_at`.
    pub fn from_entry(entry: CacheEntry<T>, read_at: Timestamp) -> Self {
        Self {
            value: entry.data,
            cached_at: entry.created_at,
            expires_at: entry.expires_at,
            read_at,
            served_from: ServedFrom::Cache,
        }
    }

    /// Wrap a value that was just fetched and written with these bounds.
    pub fn fetched(value: T, cached_at: Timestamp, expires_at: Timestamp) -> Self {
        Self {
            value,
            cached_at,
            expires_at,
            read_at: cached_at,
            served_from: ServedFrom::Network,
        }
    }

    /// Relabel as a stale fallback.
    pub fn into_stale(mut self) -> Self {
        self.served_from = ServedFrom::Stale;
        self
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn served_from(&self) -> ServedFrom {
        self.served_from
    }

    pub fn is_stale(&self) -> bool {
        self.served_from == ServedFrom::Stale
    }

    pub fn cached_at(&self) -> Timestamp {
        self.cached_at
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// Whether the entry had passed its expiry when it was read.
    pub fn is_expired(&self) -> bool {
        self.read_at > self.expires_at
    }

    /// Age of the value at read time.
    pub fn age(&self) -> Duration {
        elapsed_between(self.read_at, self.cached_at)
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            cached_at: self.cached_at,
            expires_at: self.expires_at,
            read_at: self.read_at,
            served_from: self.served_from,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_entry_read_after_expiry_reports_expired() {
        let created = Utc::now();
        let entry = CacheEntry::new("v".to_string(), created, Duration::from_millis(100)).unwrap();
        let later = entry.created_at + chrono::Duration::milliseconds(250);

        let read = CacheRead::from_entry(entry, later);
        assert!(read.is_expired());
        assert_eq!(read.age(), Duration::from_millis(250));
        assert_eq!(read.served_from(), ServedFrom::Cache);

        let stale = read.into_stale();
        assert!(stale.is_stale());
        assert_eq!(stale.map(|s| s.len()).into_value(), 1);
    }

    #[test]
    fn test_fetched_value_has_zero_age() {
        let now = Utc::now();
        let read = CacheRead::fetched(7, now, now + chrono::Duration::seconds(1));
        assert_eq!(read.age(), Duration::ZERO);
        assert!(!read.is_expired());
        assert_eq!(read.served_from(), ServedFrom::Network);
    }
}
