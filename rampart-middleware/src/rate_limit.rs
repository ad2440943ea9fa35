//! Sliding-window rate limiting.
//!
//! Each target keeps a log of accepted-call timestamps (milliseconds since
//! the epoch) in the shared [`FlatStore`] under `rate_<target>`, so limits
//! survive restarts. A call is admitted while fewer than `max_requests`
//! timestamps fall inside the trailing window. Rejected calls are not
//! recorded.
//!
//! Persistence problems fail open: the call is admitted and the problem is
//! logged.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rampart_core::{OperationError, RateLimitConfig, SharedClock, StorageError, SystemClock};
use rampart_storage::{FlatStore, RATE_NAMESPACE};

use crate::chain::RequestInterceptor;
use crate::context::MiddlewareContext;

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: usize },
    Limited { retry_after: Duration },
}

/// Persistent sliding-window limiter keyed by target.
pub struct RateLimiter {
    store: Arc<FlatStore>,
    config: RateLimitConfig,
    clock: SharedClock,
    /// Serializes read-modify-write cycles on the timestamp logs.
    guard: Mutex<()>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<FlatStore>, config: RateLimitConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<FlatStore>, config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            clock,
            guard: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check `target` and record the call if it is admitted.
    pub fn check(&self, target: &str) -> RateDecision {
        if !self.config.enabled {
            return RateDecision::Allowed {
                remaining: usize::MAX,
            };
        }
        let rule = self.config.rule_for(target);
        let window_ms = rule.window_ms as i64;
        let now_ms = self.clock.now().timestamp_millis();

        let _lock = match self.guard.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut log = match self.load(target) {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!(target, error = %e, "rate limit state unreadable; allowing call");
                return RateDecision::Allowed { remaining: 0 };
            }
        };
        log.retain(|ts| now_ms - ts < window_ms);

        if log.len() >= rule.max_requests {
            let oldest = log.iter().copied().min().unwrap_or(now_ms);
            let wait_ms = (oldest + window_ms - now_ms).max(0) as u64;
            // Persist the pruned log so stale entries do not pile up.
            if let Err(e) = self.save(target, &log) {
                tracing::warn!(target, error = %e, "rate limit state not saved");
            }
            return RateDecision::Limited {
                retry_after: Duration::from_millis(wait_ms),
            };
        }

        log.push(now_ms);
        if let Err(e) = self.save(target, &log) {
            tracing::warn!(target, error = %e, "rate limit state not saved; allowing call");
        }
        RateDecision::Allowed {
            remaining: rule.max_requests - log.len(),
        }
    }

    /// Calls still admissible for `target` in the current window.
    pub fn remaining(&self, target: &str) -> usize {
        let rule = self.config.rule_for(target);
        let window_ms = rule.window_ms as i64;
        let now_ms = self.clock.now().timestamp_millis();
        let in_window = self
            .load(target)
            .map(|log| log.iter().filter(|ts| now_ms - **ts < window_ms).count())
            .unwrap_or(0);
        rule.max_requests.saturating_sub(in_window)
    }

    /// Forget the history of `target`.
    pub fn reset(&self, target: &str) -> Result<(), StorageError> {
        self.store.remove(RATE_NAMESPACE, target)
    }

    fn load(&self, target: &str) -> Result<Vec<i64>, StorageError> {
        match self.store.get(RATE_NAMESPACE, target)? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StorageError::Serialization {
                key: format!("{RATE_NAMESPACE}{target}"),
                reason: e.to_string(),
            }),
        }
    }

    fn save(&self, target: &str, log: &[i64]) -> Result<(), StorageError> {
        if log.is_empty() {
            return self.store.remove(RATE_NAMESPACE, target);
        }
        let raw = serde_json::to_string(log).map_err(|e| StorageError::Serialization {
            key: format!("{RATE_NAMESPACE}{target}"),
            reason: e.to_string(),
        })?;
        self.store.set(RATE_NAMESPACE, target, &raw)
    }
}

/// Request interceptor that enforces a [`RateLimiter`] per target.
#[derive(Debug, Clone)]
pub struct RateLimitInterceptor {
    limiter: Arc<RateLimiter>,
}

impl RateLimitInterceptor {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl RequestInterceptor for RateLimitInterceptor {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn on_request(&self, ctx: &mut MiddlewareContext) -> Result<(), OperationError> {
        match self.limiter.check(&ctx.request.target) {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Limited { retry_after } => {
                tracing::info!(
                    operation_id = %ctx.operation_id,
                    target = %ctx.request.target,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limit exceeded"
                );
                ctx.insert_metadata("rate_limited", true);
                Err(OperationError::rate_limited(&ctx.request.target, retry_after))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{ManualClock, RateLimitRule};
    use rampart_test_utils::fixtures::manual_clock;
    use tempfile::TempDir;

    fn limiter(config: RateLimitConfig) -> (RateLimiter, ManualClock, Arc<FlatStore>) {
        let clock = manual_clock();
        let store = Arc::new(FlatStore::in_memory(64 * 1024));
        let limiter = RateLimiter::with_clock(store.clone(), config, Arc::new(clock.clone()));
        (limiter, clock, store)
    }

    fn is_allowed(decision: RateDecision) -> bool {
        matches!(decision, RateDecision::Allowed { .. })
    }

    #[test]
    fn test_eleventh_call_in_window_is_rejected() {
        let (limiter, clock, _) = limiter(RateLimitConfig::default());
        for _ in 0..10 {
            assert!(is_allowed(limiter.check("events")));
            clock.advance(Duration::from_secs(1));
        }
        // First call at t=0, now t=10s: wait until t=60s.
        assert_eq!(
            limiter.check("events"),
            RateDecision::Limited {
                retry_after: Duration::from_secs(50)
            }
        );
        assert_eq!(limiter.remaining("events"), 0);
    }

    #[test]
    fn test_window_slides_past_first_call() {
        let (limiter, clock, _) = limiter(RateLimitConfig::default());
        for _ in 0..10 {
            assert!(is_allowed(limiter.check("events")));
            clock.advance(Duration::from_secs(1));
        }
        assert!(!is_allowed(limiter.check("events")));

        // t=60s: the t=0 call leaves the window, exactly one slot opens.
        clock.advance(Duration::from_secs(50));
        assert!(is_allowed(limiter.check("events")));
        assert!(!is_allowed(limiter.check("events")));
    }

    #[test]
    fn test_rejected_calls_are_not_recorded() {
        let rule = RateLimitRule::new(Duration::from_secs(10), 1);
        let config = RateLimitConfig::default().with_override("orders", rule);
        let (limiter, clock, _) = limiter(config);

        assert!(is_allowed(limiter.check("orders")));
        for _ in 0..5 {
            clock.advance(Duration::from_secs(1));
            assert!(!is_allowed(limiter.check("orders")));
        }
        clock.advance(Duration::from_secs(5));
        assert!(is_allowed(limiter.check("orders")));
    }

    #[test]
    fn test_targets_are_independent() {
        let config = RateLimitConfig::default()
            .with_override("a", RateLimitRule::new(Duration::from_secs(60), 1));
        let (limiter, _, _) = limiter(config);
        assert!(is_allowed(limiter.check("a")));
        assert!(!is_allowed(limiter.check("a")));
        assert!(is_allowed(limiter.check("b")));
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        let (limiter, _, store) = limiter(config);
        for _ in 0..50 {
            assert!(is_allowed(limiter.check("events")));
        }
        assert!(store.entries(RATE_NAMESPACE).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_state_fails_open() {
        let (limiter, _, store) = limiter(RateLimitConfig::default());
        store.set(RATE_NAMESPACE, "events", "not json").unwrap();
        assert!(is_allowed(limiter.check("events")));
    }

    #[test]
    fn test_full_store_fails_open() {
        let clock = manual_clock();
        let store = Arc::new(FlatStore::in_memory(4));
        let limiter =
            RateLimiter::with_clock(store, RateLimitConfig::default(), Arc::new(clock));
        for _ in 0..20 {
            assert!(is_allowed(limiter.check("events")));
        }
    }

    #[test]
    fn test_history_persists_across_instances() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let path = dir.path().join("state.json");
        let clock = manual_clock();
        let config = RateLimitConfig::default()
            .with_override("events", RateLimitRule::new(Duration::from_secs(60), 2));

        {
            let store = Arc::new(FlatStore::open(&path, 4096).unwrap());
            let limiter = RateLimiter::with_clock(store, config.clone(), Arc::new(clock.clone()));
            assert!(is_allowed(limiter.check("events")));
            assert!(is_allowed(limiter.check("events")));
        }

        let store = Arc::new(FlatStore::open(&path, 4096).unwrap());
        let raw = store.get(RATE_NAMESPACE, "events").unwrap().unwrap();
        let log: Vec<i64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(log.len(), 2);

        let limiter = RateLimiter::with_clock(store, config, Arc::new(clock));
        assert!(!is_allowed(limiter.check("events")));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_never_more_than_cap_in_any_window(
                gaps in prop::collection::vec(0u64..3_000, 1..80),
                cap in 1usize..8,
            ) {
                let window = Duration::from_secs(10);
                let config = RateLimitConfig::default()
                    .with_override("t", RateLimitRule::new(window, cap));
                let (limiter, clock, _) = limiter(config);

                let mut accepted: Vec<u64> = Vec::new();
                let mut now = 0u64;
                for gap in gaps {
                    clock.advance(Duration::from_millis(gap));
                    now += gap;
                    if is_allowed(limiter.check("t")) {
                        accepted.push(now);
                    }
                }
                for (i, start) in accepted.iter().enumerate() {
                    let in_window = accepted[i..]
                        .iter()
                        .take_while(|t| **t < start + window.as_millis() as u64)
                        .count();
                    prop_assert!(in_window <= cap);
                }
            }
        }
    }
}
