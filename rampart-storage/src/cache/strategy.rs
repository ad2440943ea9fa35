//! Cache-first and network-first resilience strategies.
//!
//! Both take a fetch operation and a cache key. A successful fetch always
//! refreshes the cache; a failed fetch falls back to whatever is cached,
//! expired or not, and warns the user once. Failures never touch the
//! stored entry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rampart_core::{Notifier, OperationError, Severity};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::freshness::CacheRead;
use super::store::CacheStore;

/// User-facing message when a fallback value is served.
pub const STALE_NOTICE: &str = "Showing saved data. It may be out of date.";

/// Cache store plus the notifier used for stale-data warnings.
#[derive(Clone)]
pub struct ResilientCache {
    store: Arc<CacheStore>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for ResilientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientCache")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ResilientCache {
    pub fn new(store: Arc<CacheStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Serve a valid cached value without calling `op`; otherwise fetch.
    ///
    /// If the fetch fails, the last cached value is served as stale. With
    /// nothing cached the fetch error is returned unchanged.
    pub async fn cache_first<T, F, Fut>(
        &self,
        key: &str,
        op: F,
        ttl: Option<Duration>,
    ) -> Result<CacheRead<T>, OperationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        if let Some(read) = self.store.peek::<T>(key).await {
            if !read.is_expired() {
                self.store.record_lookup(true);
                tracing::debug!(key, "cache-first hit");
                return Ok(read);
            }
        }
        self.store.record_lookup(false);

        match op().await {
            Ok(value) => Ok(self.refresh(key, value, ttl).await),
            Err(error) => self.fall_back(key, error).await,
        }
    }

    /// Always call `op`; use the cache only when it fails.
    pub async fn network_first<T, F, Fut>(
        &self,
        key: &str,
        op: F,
        ttl: Option<Duration>,
    ) -> Result<CacheRead<T>, OperationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        match op().await {
            Ok(value) => Ok(self.refresh(key, value, ttl).await),
            Err(error) => self.fall_back(key, error).await,
        }
    }

    async fn refresh<T: Serialize>(&self, key: &str, value: T, ttl: Option<Duration>) -> CacheRead<T> {
        match self.store.write_entry(key, &value, ttl).await {
            Some(meta) => CacheRead::fetched(value, meta.created_at, meta.expires_at),
            None => {
                let now = self.store.now();
                CacheRead::fetched(value, now, now)
            }
        }
    }

    async fn fall_back<T: DeserializeOwned>(
        &self,
        key: &str,
        error: OperationError,
    ) -> Result<CacheRead<T>, OperationError> {
        let Some(read) = self.store.peek::<T>(key).await else {
            tracing::debug!(key, error = %error, "fetch failed with nothing cached");
            return Err(error);
        };
        tracing::warn!(
            key,
            error = %error,
            kind = %error.kind(),
            age_ms = read.age().as_millis() as u64,
            "fetch failed; serving cached value"
        );
        self.notifier.notify(STALE_NOTICE, Severity::Warn);
        Ok(read.into_stale())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cache::freshness::ServedFrom;
    use rampart_core::{CacheSettings, ManualClock};
    use rampart_test_utils::{RecordingNotifier, ScriptedOperation};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Event {
        id: String,
    }

    fn events(ids: &[&str]) -> Vec<Event> {
        ids.iter().map(|id| Event { id: id.to_string() }).collect()
    }

    fn setup() -> (ResilientCache, ManualClock, Arc<RecordingNotifier>) {
        let clock = ManualClock::starting_now();
        let store = CacheStore::with_backend(
            Arc::new(MemoryBackend::new()),
            &CacheSettings::default(),
            Arc::new(clock.clone()),
        );
        let notifier = Arc::new(RecordingNotifier::new());
        let cache = ResilientCache::new(Arc::new(store), notifier.clone());
        (cache, clock, notifier)
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_operation() {
        let (cache, _clock, _) = setup();
        cache.store().set("events", &events(&["e1"]), None).await;

        let op = ScriptedOperation::new(vec![Ok(events(&["e2"]))]);
        let read = cache.cache_first("events", || op.call(), None).await.unwrap();

        assert_eq!(op.calls(), 0);
        assert_eq!(read.served_from(), ServedFrom::Cache);
        assert_eq!(read.into_value(), events(&["e1"]));
    }

    #[tokio::test]
    async fn test_cache_first_refetches_after_expiry() {
        let (cache, clock, notifier) = setup();
        cache
            .store()
            .set("events", &events(&["e1"]), Some(Duration::from_millis(1000)))
            .await;
        clock.advance(Duration::from_millis(1001));

        let op = ScriptedOperation::new(vec![Ok(events(&["e1", "e2"]))]);
        let read = cache.cache_first("events", || op.call(), None).await.unwrap();

        assert_eq!(op.calls(), 1);
        assert_eq!(read.served_from(), ServedFrom::Network);
        assert_eq!(read.value(), &events(&["e1", "e2"]));
        assert_eq!(read.expires_at() - read.cached_at(), chrono::Duration::minutes(5));
        assert_eq!(
            cache.store().get::<Vec<Event>>("events").await,
            Some(events(&["e1", "e2"]))
        );
        assert!(notifier.is_empty());
    }

    #[tokio::test]
    async fn test_cache_first_serves_expired_value_when_fetch_fails() {
        let (cache, clock, notifier) = setup();
        cache
            .store()
            .set("events", &events(&["e1"]), Some(Duration::from_millis(10)))
            .await;
        clock.advance(Duration::from_millis(20));

        let op = ScriptedOperation::<Vec<Event>>::new(vec![Err(OperationError::network("down"))]);
        let read = cache.cache_first("events", || op.call(), None).await.unwrap();

        assert!(read.is_stale());
        assert!(read.is_expired());
        assert_eq!(read.into_value(), events(&["e1"]));
        assert_eq!(notifier.count_at(Severity::Warn), 1);
    }

    #[tokio::test]
    async fn test_cache_first_propagates_error_without_cache() {
        let (cache, _clock, notifier) = setup();
        let op = ScriptedOperation::<Vec<Event>>::new(vec![Err(
            OperationError::new("boom").with_status(500),
        )]);

        let err = cache.cache_first("events", || op.call(), None).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(notifier.is_empty());
        assert!(!cache.store().has("events").await);
    }

    #[tokio::test]
    async fn test_network_first_always_calls_and_refreshes() {
        let (cache, _clock, _) = setup();
        cache.store().set("events", &events(&["old"]), None).await;

        let op = ScriptedOperation::new(vec![Ok(events(&["new"]))]);
        let read = cache.network_first("events", || op.call(), None).await.unwrap();

        assert_eq!(op.calls(), 1);
        assert_eq!(read.served_from(), ServedFrom::Network);
        assert_eq!(
            cache.store().get::<Vec<Event>>("events").await,
            Some(events(&["new"]))
        );
    }

    #[tokio::test]
    async fn test_network_first_falls_back_and_notifies_once() {
        let (cache, _clock, notifier) = setup();
        cache.store().set("events", &events(&["e1"]), None).await;
        let before = cache.store().fingerprint("events").await;

        let op = ScriptedOperation::<Vec<Event>>::new(vec![Err(OperationError::timeout("slow"))]);
        let read = cache.network_first("events", || op.call(), None).await.unwrap();

        assert_eq!(read.served_from(), ServedFrom::Stale);
        assert_eq!(read.into_value(), events(&["e1"]));
        assert_eq!(notifier.len(), 1);
        assert_eq!(notifier.messages()[0], (STALE_NOTICE.to_string(), Severity::Warn));
        assert_eq!(cache.store().fingerprint("events").await, before);
    }

    #[tokio::test]
    async fn test_custom_ttl_is_honored() {
        let (cache, clock, _) = setup();
        let op = ScriptedOperation::new(vec![Ok(1u32), Ok(2u32)]);

        cache
            .network_first("n", || op.call(), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(60));

        let read = cache.cache_first("n", || op.call(), None).await.unwrap();
        assert_eq!(op.calls(), 2);
        assert_eq!(read.into_value(), 2);
    }
}
