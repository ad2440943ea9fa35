//! RAMPART Test Utilities
//!
//! Shared test infrastructure for the RAMPART workspace:
//! - Recording collaborators (notifier, session hook)
//! - Scripted operations that count their invocations
//! - Proptest generators for errors, keys and configuration
//! - Test fixtures and custom assertions

pub use rampart_core::{
    ErrorKind, ManualClock, Notifier, OperationError, RampartConfig, RetryConfig, SessionHook,
    Severity,
};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// RECORDING COLLABORATORS
// ============================================================================

/// Notifier that keeps every message it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, Severity)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything notified so far, in order.
    pub fn messages(&self) -> Vec<(String, Severity)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of messages at `severity`.
    pub fn count_at(&self, severity: Severity) -> usize {
        self.messages
            .lock()
            .map(|m| m.iter().filter(|(_, s)| *s == severity).count())
            .unwrap_or(0)
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((message.to_string(), severity));
        }
    }
}

/// Session hook that counts its invocations.
#[derive(Debug, Default)]
pub struct RecordingSession {
    cleared: AtomicUsize,
    redirects: AtomicUsize,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cleared(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }

    pub fn redirects(&self) -> usize {
        self.redirects.load(Ordering::SeqCst)
    }
}

impl SessionHook for RecordingSession {
    fn clear_credentials(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn redirect_to_sign_in(&self) {
        self.redirects.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// SCRIPTED OPERATIONS
// ============================================================================

/// Operation that replays a fixed script of outcomes.
///
/// Each call pops the next outcome; once the script runs out the last
/// outcome repeats. Clones share the script and the call counter, and the
/// returned futures own their data so they can be spawned.
#[derive(Debug, Clone)]
pub struct ScriptedOperation<T> {
    script: Arc<Mutex<VecDeque<Result<T, OperationError>>>>,
    last: Arc<Mutex<Option<Result<T, OperationError>>>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl<T: Clone + Send + 'static> ScriptedOperation<T> {
    pub fn new(script: Vec<Result<T, OperationError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            last: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    /// Always succeed with `value`.
    pub fn succeeding(value: T) -> Self {
        Self::new(vec![Ok(value)])
    }

    /// Fail `failures` times with `error`, then succeed with `value`.
    pub fn flaky(failures: usize, error: OperationError, value: T) -> Self {
        let mut script: Vec<_> = (0..failures).map(|_| Err(error.clone())).collect();
        script.push(Ok(value));
        Self::new(script)
    }

    /// Sleep for `delay` (tokio time) before resolving.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times the operation has been started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Start one invocation.
    pub fn call(&self) -> impl Future<Output = Result<T, OperationError>> + Send + 'static {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();
        let delay = self.delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
    }

    fn next_outcome(&self) -> Result<T, OperationError> {
        let popped = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let mut last = match self.last.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        match popped {
            Some(outcome) => {
                *last = Some(outcome.clone());
                outcome
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(OperationError::new("script exhausted"))),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for RAMPART types.

    use super::*;
    use proptest::prelude::*;

    /// Cache key in the `verb:resource:id` shape callers use.
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        ("[a-z]{1,8}", "[a-z]{1,8}", "[a-z0-9]{1,12}")
            .prop_map(|(verb, resource, id)| format!("{verb}:{resource}:{id}"))
    }

    /// TTL between 1ms and one day.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..86_400_000).prop_map(Duration::from_millis)
    }

    /// Small JSON document of the kind an API returns.
    pub fn arb_json_payload() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-zA-Z0-9 ]{0,24}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    /// HTTP-ish status code, or none.
    pub fn arb_status() -> impl Strategy<Value = Option<u16>> {
        prop_oneof![
            Just(None),
            (100u16..600).prop_map(Some),
        ]
    }

    /// Error code drawn from the recognized families plus noise.
    pub fn arb_error_code() -> impl Strategy<Value = Option<String>> {
        prop_oneof![
            Just(None),
            prop::sample::select(vec![
                "NETWORK_ERROR",
                "ERR_NETWORK",
                "ECONNREFUSED",
                "ETIMEDOUT",
                "TIMEOUT",
                "RATE_LIMITED",
                "UNAUTHORIZED",
                "PGRST301",
                "VALIDATION",
                "INVALID_INPUT",
            ])
            .prop_map(|c| Some(c.to_string())),
            "[A-Z_]{3,12}".prop_map(Some),
        ]
    }

    /// Operation error with random status and code.
    pub fn arb_operation_error() -> impl Strategy<Value = OperationError> {
        ("[a-z ]{1,32}", arb_status(), arb_error_code()).prop_map(|(message, status, code)| {
            let mut error = OperationError::new(message);
            if let Some(status) = status {
                error = error.with_status(status);
            }
            if let Some(code) = code {
                error = error.with_code(code);
            }
            error
        })
    }

    /// Valid retry configuration.
    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (1u32..6, 1u64..1000, 1000u64..60_000, 1.0f64..4.0).prop_map(
            |(max_attempts, initial_backoff_ms, max_backoff_ms, backoff_multiplier)| RetryConfig {
                max_attempts,
                initial_backoff_ms,
                max_backoff_ms,
                backoff_multiplier,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use chrono::{DateTime, Utc};

    /// Fixed instant used by clock-driven tests.
    pub fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap_or_default()
    }

    /// Manual clock pinned at [`epoch`].
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }

    /// Configuration with the limiter capped at `max_requests` per `window`.
    pub fn config_with_rate_limit(window: Duration, max_requests: usize) -> RampartConfig {
        let mut config = RampartConfig::default();
        config.rate_limit.window_ms = window.as_millis() as u64;
        config.rate_limit.max_requests = max_requests;
        config
    }

    /// Retry configuration with millisecond backoffs.
    pub fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_multiplier: 2.0,
        }
    }

    pub fn auth_error() -> OperationError {
        OperationError::new("session expired").with_status(401)
    }

    pub fn server_error() -> OperationError {
        OperationError::new("internal error").with_status(500)
    }

    pub fn validation_error() -> OperationError {
        OperationError::new("bad input").with_status(422)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for RAMPART results.

    use super::*;

    /// Assert that `result` failed with an error of `kind`.
    #[track_caller]
    pub fn assert_kind<T: std::fmt::Debug>(result: &Result<T, OperationError>, kind: ErrorKind) {
        match result {
            Err(e) => assert_eq!(e.kind(), kind, "wrong classification for {e:?}"),
            Ok(v) => panic!("Expected {kind} error, got Ok({v:?})"),
        }
    }

    /// Assert that `notifier` received exactly one message, at `severity`.
    #[track_caller]
    pub fn assert_single_notification(notifier: &RecordingNotifier, severity: Severity) {
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1, "expected one notification, got {messages:?}");
        assert_eq!(messages[0].1, severity, "wrong severity in {messages:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_operation_repeats_last_outcome() {
        let op = ScriptedOperation::flaky(1, OperationError::network("down"), 7u8);
        assert!(op.call().await.is_err());
        assert_eq!(op.call().await.unwrap(), 7);
        assert_eq!(op.call().await.unwrap(), 7);
        assert_eq!(op.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_script_fails() {
        let op = ScriptedOperation::<u8>::new(vec![]);
        assert!(op.call().await.is_err());
    }

    #[test]
    fn test_recording_notifier_counts_by_severity() {
        let notifier = RecordingNotifier::new();
        notifier.notify("a", Severity::Warn);
        notifier.notify("b", Severity::Error);
        notifier.notify("c", Severity::Warn);
        assert_eq!(notifier.len(), 3);
        assert_eq!(notifier.count_at(Severity::Warn), 2);
    }
}
