//! The [`OperationCoordinator`] facade.

use std::future::Future;

use rampart_core::{DedupConfig, OperationError, RampartConfig, RetryConfig};

use crate::batch::{run_batch, BatchItem, BatchReport};
use crate::dedup::DedupCache;
use crate::retry::{with_retry, RetryPolicy};

/// Dedup, retry and batch execution behind one handle.
///
/// Share it behind an `Arc`; every method takes `&self`.
#[derive(Debug, Default)]
pub struct OperationCoordinator {
    dedup: DedupCache,
    retry: RetryPolicy,
}

impl OperationCoordinator {
    pub fn new(dedup: &DedupConfig, retry: &RetryConfig) -> Self {
        Self {
            dedup: DedupCache::new(dedup),
            retry: RetryPolicy::from_config(retry),
        }
    }

    pub fn from_config(config: &RampartConfig) -> Self {
        Self::new(&config.dedup, &config.retry)
    }

    /// Policy built from the configured [`RetryConfig`].
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Collapse concurrent identical calls for `key` into one execution.
    pub async fn with_dedup<T, F, Fut>(&self, key: &str, op: F) -> Result<T, OperationError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        self.dedup.run(key, op).await
    }

    /// Retry `op` under `policy`, or the configured policy when `None`.
    pub async fn with_retry<T, F, Fut>(
        &self,
        op: F,
        policy: Option<&RetryPolicy>,
    ) -> Result<T, OperationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        with_retry(op, policy.unwrap_or(&self.retry)).await
    }

    pub async fn run_batch<I, R, F, Fut, P>(
        &self,
        items: Vec<I>,
        op: F,
        concurrency: usize,
        on_progress: P,
    ) -> BatchReport
    where
        I: BatchItem,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<R, OperationError>>,
        P: FnMut(usize, usize),
    {
        run_batch(items, op, concurrency, on_progress).await
    }

    /// Operations currently running under a dedup key.
    pub fn in_flight_count(&self) -> usize {
        self.dedup.in_flight_count()
    }

    /// Drop every dedup entry.
    pub fn clear(&self) {
        self.dedup.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use rampart_test_utils::{fixtures, ScriptedOperation};

    #[tokio::test(start_paused = true)]
    async fn test_configured_policy_applies_by_default() {
        let mut config = RampartConfig::default();
        config.retry = fixtures::fast_retry(2);
        let coordinator = OperationCoordinator::from_config(&config);

        let op = ScriptedOperation::<u8>::new(vec![Err(fixtures::server_error())]);
        let result = coordinator.with_retry(|| op.call(), None).await;
        assert!(result.is_err());
        assert_eq!(op.calls(), 2);

        let wider = RetryPolicy::new(4, Duration::from_millis(1));
        let op = ScriptedOperation::<u8>::new(vec![Err(fixtures::server_error())]);
        let _ = coordinator.with_retry(|| op.call(), Some(&wider)).await;
        assert_eq!(op.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_count_tracks_running_leaders() {
        let coordinator = Arc::new(OperationCoordinator::default());
        let op = ScriptedOperation::succeeding(1u8).with_delay(Duration::from_millis(50));

        let running = {
            let coordinator = coordinator.clone();
            let op = op.clone();
            tokio::spawn(async move { coordinator.with_dedup("k", || op.call()).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(coordinator.in_flight_count(), 1);

        assert_eq!(running.await.unwrap().unwrap(), 1);
        assert_eq!(coordinator.in_flight_count(), 0);

        coordinator.clear();
        coordinator.with_dedup("k", || op.call()).await.unwrap();
        assert_eq!(op.calls(), 2);
    }
}
