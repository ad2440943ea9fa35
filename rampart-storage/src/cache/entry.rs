//! Serialized cache entry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rampart_core::{compute_fingerprint, Timestamp};
use serde::{Deserialize, Serialize};

/// Smallest TTL an entry can carry; keeps `expires_at > created_at`.
pub const MIN_TTL: Duration = Duration::from_millis(1);

/// One cached value with its lifetime.
///
/// Timestamps are stored as milliseconds since the epoch, field names in
/// camelCase. An entry is valid while `now <= expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: Timestamp,
    pub fingerprint: String,
}

impl<T: Serialize> CacheEntry<T> {
    /// Build an entry created at `now` that lives for `ttl`.
    ///
    /// Fails only if `data` cannot be serialized.
    pub fn new(data: T, now: Timestamp, ttl: Duration) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_vec(&data)?;
        let created_at = truncate_to_millis(now);
        Ok(Self {
            data,
            created_at,
            expires_at: expiry_after(created_at, ttl),
            fingerprint: compute_fingerprint(&encoded),
        })
    }
}

impl<T> CacheEntry<T> {
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            created_at: self.created_at,
            expires_at: self.expires_at,
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Entry header, parsed without touching the payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: Timestamp,
    pub fingerprint: String,
}

impl EntryMeta {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

fn truncate_to_millis(ts: Timestamp) -> Timestamp {
    DateTime::<Utc>::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

fn expiry_after(created_at: Timestamp, ttl: Duration) -> Timestamp {
    let ttl = ttl.max(MIN_TTL);
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| created_at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
