//! Sequential retry with exponential backoff.
//!
//! After failed attempt `n` (counting from zero) the loop waits
//! `initial_backoff * multiplier^n`, capped at `max_backoff`. Only the last
//! error reaches the caller. Retried operations must be safe to repeat.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rampart_core::{OperationError, RetryConfig};

type RetryPredicate = Arc<dyn Fn(&OperationError) -> bool + Send + Sync>;

/// How many times to try and how long to wait in between.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    should_retry: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::from_config(config)
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            should_retry: None,
        }
    }

    /// `max_attempts` tries, doubling from `base_delay` with no practical cap.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: base_delay,
            max_backoff: Duration::MAX,
            multiplier: 2.0,
            should_retry: None,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Stop early when `predicate` returns false for an error.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&OperationError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Retry network, timeout, server and rate-limit failures only.
    pub fn transient_only(self) -> Self {
        self.retry_if(|error| error.kind().is_transient())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, error: &OperationError) -> bool {
        self.should_retry
            .as_ref()
            .map_or(true, |predicate| predicate(error))
    }

    /// Wait after failed attempt `attempt` (zero-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds or the policy gives up.
pub async fn with_retry<T, F, Fut>(mut op: F, policy: &RetryPolicy) -> Result<T, OperationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
{
    let mut attempt = 0u32;
    loop {
        let error = match op().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let attempts_made = attempt + 1;
        if attempts_made >= policy.max_attempts {
            tracing::warn!(
                attempts = attempts_made,
                kind = %error.kind(),
                error = %error,
                "operation failed after final attempt"
            );
            return Err(error);
        }
        if !policy.should_retry(&error) {
            tracing::debug!(
                attempt = attempts_made,
                kind = %error.kind(),
                "error not retryable; giving up"
            );
            return Err(error);
        }

        let delay = policy.backoff_for(attempt);
        tracing::warn!(
            attempt = attempts_made,
            delay_ms = delay.as_millis() as u64,
            kind = %error.kind(),
            error = %error,
            "operation failed; retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::ErrorKind;
    use rampart_test_utils::{fixtures, ScriptedOperation};
    use tokio::time::Instant;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::from_config(&RetryConfig::default());
        assert_eq!(policy.backoff_for(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(30));
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let op = ScriptedOperation::flaky(2, fixtures::server_error(), "sent");
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let started = Instant::now();

        let result = with_retry(|| op.call(), &policy).await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(op.calls(), 3);
        // 100ms after the first failure, 200ms after the second.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_last_error_after_max_attempts() {
        let op = ScriptedOperation::<u8>::new(vec![
            Err(OperationError::network("first")),
            Err(OperationError::network("second")),
            Err(OperationError::network("third")),
        ]);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let err = with_retry(|| op.call(), &policy).await.unwrap_err();
        assert_eq!(err.message(), "third");
        assert_eq!(op.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_stops_on_permanent_error() {
        let op = ScriptedOperation::<u8>::new(vec![Err(fixtures::validation_error())]);
        let policy = RetryPolicy::new(5, Duration::from_millis(10)).transient_only();

        let result = with_retry(|| op.call(), &policy).await;
        rampart_test_utils::assertions::assert_kind(&result, ErrorKind::Validation);
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_does_not_sleep() {
        let op = ScriptedOperation::<u8>::new(vec![Err(fixtures::server_error())]);
        let started = Instant::now();
        let _ = with_retry(|| op.call(), &RetryPolicy::new(1, Duration::from_secs(5))).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use rampart_test_utils::generators::arb_retry_config;

        proptest! {
            #[test]
            fn prop_backoff_never_exceeds_cap(config in arb_retry_config(), attempt in 0u32..64) {
                let policy = RetryPolicy::from_config(&config);
                prop_assert!(policy.backoff_for(attempt) <= Duration::from_millis(config.max_backoff_ms));
            }

            #[test]
            fn prop_backoff_is_monotonic(config in arb_retry_config(), attempt in 0u32..32) {
                let policy = RetryPolicy::from_config(&config);
                prop_assert!(policy.backoff_for(attempt) <= policy.backoff_for(attempt + 1));
            }
        }
    }
}
