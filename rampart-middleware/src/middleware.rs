//! The request pipeline.
//!
//! Every call moves through the same phases:
//!
//! ```text
//! Created -> RequestPhase -> Executing -> ResponsePhase -> Done
//!                 |              |
//!                 | (rejected)   +-------> ErrorPhase ----> Done
//!                 +----------------------> ErrorPhase ----> Done
//! ```
//!
//! The pipeline holds the outcome itself; observer interceptors only see the
//! context, so nothing they do can change what the caller gets back.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use rampart_core::{
    AlwaysOnline, Connectivity, MiddlewareSettings, NoopSession, Notifier, OperationError,
    RateLimitConfig, SessionHook, SharedClock, SystemClock, TracingNotifier,
};
use rampart_storage::FlatStore;
use serde::Serialize;
use tokio::time::Instant;

use crate::chain::{
    ErrorChain, ErrorInterceptor, RequestChain, RequestInterceptor, ResponseChain,
    ResponseInterceptor,
};
use crate::context::{MiddlewareContext, RequestInfo, ResponseInfo};
use crate::interceptors::{
    AuthErrorHandler, ErrorLogger, ErrorNotifier, RequestLogger, ResponseLogger,
};
use crate::rate_limit::{RateLimitInterceptor, RateLimiter};

/// Lifecycle phase of a wrapped call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Created,
    RequestPhase,
    Executing,
    ResponsePhase,
    ErrorPhase,
    Done,
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::RequestPhase => "request",
            Self::Executing => "executing",
            Self::ResponsePhase => "response",
            Self::ErrorPhase => "error",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

fn enter(ctx: &MiddlewareContext, phase: CallPhase) {
    tracing::trace!(operation_id = %ctx.operation_id, target = %ctx.request.target, phase = %phase, "call phase");
}

/// Interceptor pipeline around arbitrary async operations.
#[derive(Clone)]
pub struct RequestMiddleware {
    request_chain: RequestChain,
    response_chain: ResponseChain,
    error_chain: ErrorChain,
    clock: SharedClock,
}

impl fmt::Debug for RequestMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMiddleware")
            .field("request", &self.request_chain.names())
            .field("response", &self.response_chain.names())
            .field("error", &self.error_chain.names())
            .finish()
    }
}

impl RequestMiddleware {
    pub fn builder() -> RequestMiddlewareBuilder {
        RequestMiddlewareBuilder::default()
    }

    pub fn register_request(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
        self.request_chain.push(interceptor);
    }

    pub fn register_response(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
        self.response_chain.push(interceptor);
    }

    pub fn register_error(&mut self, interceptor: Arc<dyn ErrorInterceptor>) {
        self.error_chain.push(interceptor);
    }

    pub fn request_interceptors(&self) -> Vec<&'static str> {
        self.request_chain.names()
    }

    pub fn response_interceptors(&self) -> Vec<&'static str> {
        self.response_chain.names()
    }

    pub fn error_interceptors(&self) -> Vec<&'static str> {
        self.error_chain.names()
    }

    /// Run `op` through every phase and hand back its own outcome.
    ///
    /// A request interceptor rejection replaces the call: `op` is never
    /// started and the rejection goes through the error phase.
    pub async fn execute<T, F, Fut>(&self, request: RequestInfo, op: F) -> Result<T, OperationError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let mut ctx = MiddlewareContext::new(request, self.clock.now());
        enter(&ctx, CallPhase::Created);
        let started = Instant::now();

        enter(&ctx, CallPhase::RequestPhase);
        let outcome = match self.request_chain.run(&mut ctx).await {
            Ok(()) => {
                enter(&ctx, CallPhase::Executing);
                op().await
            }
            Err(rejection) => Err(rejection),
        };
        let duration = started.elapsed();

        match outcome {
            Ok(value) => {
                enter(&ctx, CallPhase::ResponsePhase);
                let payload = serde_json::to_value(&value).ok();
                ctx.response = Some(ResponseInfo::success(payload, duration));
                self.response_chain.run(&mut ctx).await;
                enter(&ctx, CallPhase::Done);
                Ok(value)
            }
            Err(error) => {
                enter(&ctx, CallPhase::ErrorPhase);
                ctx.classification = Some(error.kind());
                ctx.response = Some(ResponseInfo::failure(error.clone(), duration));
                self.error_chain.run(&mut ctx).await;
                enter(&ctx, CallPhase::Done);
                Err(error)
            }
        }
    }
}

/// Byte quota of the in-memory store behind the default rate limiter.
const DEFAULT_RATE_STATE_BYTES: u64 = 1024 * 1024;

/// Builder that installs the default interceptors.
///
/// Without an explicit [`RateLimiter`], one is built from the configured
/// [`RateLimitConfig`] over an in-memory store. Set `enabled: false` to
/// leave rate limiting out.
pub struct RequestMiddlewareBuilder {
    notifier: Arc<dyn Notifier>,
    session: Arc<dyn SessionHook>,
    connectivity: Arc<dyn Connectivity>,
    rate_limiter: Option<Arc<RateLimiter>>,
    rate_limit: RateLimitConfig,
    settings: MiddlewareSettings,
    clock: SharedClock,
}

impl Default for RequestMiddlewareBuilder {
    fn default() -> Self {
        Self {
            notifier: Arc::new(TracingNotifier),
            session: Arc::new(NoopSession),
            connectivity: Arc::new(AlwaysOnline),
            rate_limiter: None,
            rate_limit: RateLimitConfig::default(),
            settings: MiddlewareSettings::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl RequestMiddlewareBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn session(mut self, session: Arc<dyn SessionHook>) -> Self {
        self.session = session;
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Enforce `limiter` on every call's target.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Limits for the built-in limiter. Ignored when a limiter is supplied.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn settings(mut self, settings: MiddlewareSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> RequestMiddleware {
        let mut request_chain = RequestChain::new();
        request_chain.push(Arc::new(RequestLogger));
        let limiter = match self.rate_limiter {
            Some(limiter) => Some(limiter),
            None if self.rate_limit.enabled => Some(Arc::new(RateLimiter::with_clock(
                Arc::new(FlatStore::in_memory(DEFAULT_RATE_STATE_BYTES)),
                self.rate_limit,
                self.clock.clone(),
            ))),
            None => None,
        };
        if let Some(limiter) = limiter {
            request_chain.push(Arc::new(RateLimitInterceptor::new(limiter)));
        }

        let mut response_chain = ResponseChain::new();
        response_chain.push(Arc::new(ResponseLogger));

        let mut error_chain = ErrorChain::new();
        error_chain.push(Arc::new(ErrorLogger));
        error_chain.push(Arc::new(AuthErrorHandler::new(
            self.session,
            self.settings.redirect_delay(),
        )));
        if self.settings.notify_errors {
            error_chain.push(Arc::new(ErrorNotifier::new(self.notifier, self.connectivity)));
        }

        RequestMiddleware {
            request_chain,
            response_chain,
            error_chain,
            clock: self.clock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterceptorError;
    use async_trait::async_trait;
    use rampart_core::{ErrorKind, RateLimitConfig, RateLimitRule, Severity};
    use rampart_storage::FlatStore;
    use rampart_test_utils::assertions::{assert_kind, assert_single_notification};
    use rampart_test_utils::{fixtures, RecordingNotifier, RecordingSession, ScriptedOperation};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Captures the context each phase saw.
    #[derive(Default)]
    struct Capture {
        seen: Mutex<Vec<MiddlewareContext>>,
    }

    impl Capture {
        fn last(&self) -> MiddlewareContext {
            self.seen.lock().unwrap().last().cloned().expect("captured a context")
        }
    }

    #[async_trait]
    impl ResponseInterceptor for Capture {
        fn name(&self) -> &'static str {
            "capture"
        }

        async fn on_response(&self, ctx: &mut MiddlewareContext) -> Result<(), InterceptorError> {
            self.seen.lock().unwrap().push(ctx.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl ErrorInterceptor for Capture {
        fn name(&self) -> &'static str {
            "capture"
        }

        async fn on_error(&self, ctx: &mut MiddlewareContext) -> Result<(), InterceptorError> {
            self.seen.lock().unwrap().push(ctx.clone());
            Ok(())
        }
    }

    /// Fails and tries to scribble over the response.
    struct Vandal;

    #[async_trait]
    impl ResponseInterceptor for Vandal {
        fn name(&self) -> &'static str {
            "vandal"
        }

        async fn on_response(&self, ctx: &mut MiddlewareContext) -> Result<(), InterceptorError> {
            ctx.response = Some(ResponseInfo::success(Some(json!("tampered")), Duration::ZERO));
            Err(InterceptorError::failed("vandal", "boom"))
        }
    }

    fn middleware_with(
        notifier: Arc<RecordingNotifier>,
        session: Arc<RecordingSession>,
    ) -> RequestMiddleware {
        RequestMiddleware::builder()
            .notifier(notifier)
            .session(session)
            .build()
    }

    #[test]
    fn test_default_interceptors_in_order() {
        let middleware = RequestMiddleware::builder().build();
        assert_eq!(
            middleware.request_interceptors(),
            vec!["request_logger", "rate_limit"]
        );
        assert_eq!(middleware.response_interceptors(), vec!["response_logger"]);
        assert_eq!(
            middleware.error_interceptors(),
            vec!["error_logger", "auth_error_handler", "error_notifier"]
        );

        let quiet = RequestMiddleware::builder()
            .settings(MiddlewareSettings {
                notify_errors: false,
                ..MiddlewareSettings::default()
            })
            .build();
        assert_eq!(
            quiet.error_interceptors(),
            vec!["error_logger", "auth_error_handler"]
        );

        let unlimited = RequestMiddleware::builder()
            .rate_limit(RateLimitConfig {
                enabled: false,
                ..RateLimitConfig::default()
            })
            .build();
        assert_eq!(unlimited.request_interceptors(), vec!["request_logger"]);

        let explicit = Arc::new(RateLimiter::new(
            Arc::new(FlatStore::in_memory(1024)),
            RateLimitConfig::default(),
        ));
        let supplied = RequestMiddleware::builder().rate_limiter(explicit).build();
        assert_eq!(
            supplied.request_interceptors(),
            vec!["request_logger", "rate_limit"]
        );
    }

    #[tokio::test]
    async fn test_default_builder_limits_eleventh_call() {
        let notifier = Arc::new(RecordingNotifier::new());
        let middleware = RequestMiddleware::builder()
            .notifier(notifier.clone())
            .clock(Arc::new(fixtures::manual_clock()))
            .build();
        let op = ScriptedOperation::succeeding(1u8);

        for _ in 0..10 {
            middleware
                .execute(RequestInfo::new("events", "GET"), || op.call())
                .await
                .unwrap();
        }
        let eleventh = middleware
            .execute(RequestInfo::new("events", "GET"), || op.call())
            .await;

        assert_kind(&eleventh, ErrorKind::RateLimited);
        assert_eq!(op.calls(), 10);
        assert_single_notification(&notifier, Severity::Warn);
    }

    #[tokio::test]
    async fn test_success_flows_through_response_phase() {
        let notifier = Arc::new(RecordingNotifier::new());
        let mut middleware = middleware_with(notifier.clone(), Arc::new(RecordingSession::new()));
        let capture = Arc::new(Capture::default());
        middleware.register_response(capture.clone());

        let op = ScriptedOperation::succeeding(vec![json!({"id": "e1"})]);
        let value = middleware
            .execute(RequestInfo::new("events", "GET"), || op.call())
            .await
            .unwrap();

        assert_eq!(value, vec![json!({"id": "e1"})]);
        let ctx = capture.last();
        let response = ctx.response.expect("response recorded");
        assert_eq!(response.payload(), Some(&json!([{"id": "e1"}])));
        assert!(response.error().is_none());
        assert!(ctx.classification.is_none());
        assert!(notifier.is_empty());
    }

    #[tokio::test]
    async fn test_failing_observer_does_not_alter_result() {
        let mut middleware = RequestMiddleware::builder().build();
        let capture = Arc::new(Capture::default());
        middleware.register_response(Arc::new(Vandal));
        middleware.register_response(capture.clone());

        let value: Value = middleware
            .execute(RequestInfo::new("events", "GET"), || async { Ok(json!("real")) })
            .await
            .unwrap();

        assert_eq!(value, json!("real"));
        assert_eq!(capture.seen.lock().unwrap().len(), 1);
        let seen = capture.last().response.expect("response recorded");
        assert_eq!(seen.payload(), Some(&json!("real")));
    }

    #[tokio::test]
    async fn test_error_is_classified_and_notified_once() {
        let notifier = Arc::new(RecordingNotifier::new());
        let mut middleware = middleware_with(notifier.clone(), Arc::new(RecordingSession::new()));
        let capture = Arc::new(Capture::default());
        middleware.register_error(capture.clone());

        let result: Result<Value, _> = middleware
            .execute(RequestInfo::new("orders", "POST"), || async {
                Err(fixtures::server_error())
            })
            .await;

        assert_kind(&result, ErrorKind::Server);
        assert_eq!(result.unwrap_err(), fixtures::server_error());
        assert_single_notification(&notifier, Severity::Error);

        let ctx = capture.last();
        assert_eq!(ctx.classification, Some(ErrorKind::Server));
        assert_eq!(ctx.error().and_then(|e| e.status()), Some(500));
        assert_eq!(ctx.metadata.get("notified"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_silent_request_skips_notification() {
        let notifier = Arc::new(RecordingNotifier::new());
        let middleware = middleware_with(notifier.clone(), Arc::new(RecordingSession::new()));

        let result: Result<Value, _> = middleware
            .execute(RequestInfo::new("orders", "POST").silent(), || async {
                Err(fixtures::server_error())
            })
            .await;

        assert!(result.is_err());
        assert!(notifier.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_logs_out_and_redirects() {
        let notifier = Arc::new(RecordingNotifier::new());
        let session = Arc::new(RecordingSession::new());
        let middleware = middleware_with(notifier.clone(), session.clone());

        let result: Result<Value, _> = middleware
            .execute(RequestInfo::new("profile", "GET"), || async {
                Err(fixtures::auth_error())
            })
            .await;

        assert_kind(&result, ErrorKind::Auth);
        assert_eq!(session.cleared(), 1);
        assert_single_notification(&notifier, Severity::Warn);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(session.redirects(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_call_never_executes() {
        let notifier = Arc::new(RecordingNotifier::new());
        let config = RateLimitConfig::default()
            .with_override("search", RateLimitRule::new(Duration::from_secs(60), 2));
        let limiter = Arc::new(RateLimiter::with_clock(
            Arc::new(FlatStore::in_memory(4096)),
            config,
            Arc::new(fixtures::manual_clock()),
        ));
        let middleware = RequestMiddleware::builder()
            .notifier(notifier.clone())
            .rate_limiter(limiter)
            .build();

        let op = ScriptedOperation::succeeding(1u8);
        for _ in 0..2 {
            middleware
                .execute(RequestInfo::new("search", "GET"), || op.call())
                .await
                .unwrap();
        }
        let third = middleware
            .execute(RequestInfo::new("search", "GET"), || op.call())
            .await;

        assert_eq!(op.calls(), 2);
        assert_kind(&third, ErrorKind::RateLimited);
        assert_eq!(third.unwrap_err().retry_after(), Some(Duration::from_secs(60)));
        assert_single_notification(&notifier, Severity::Warn);
    }

    #[tokio::test]
    async fn test_each_call_gets_its_own_operation_id() {
        let mut middleware = RequestMiddleware::builder().build();
        let capture = Arc::new(Capture::default());
        middleware.register_response(capture.clone());

        for _ in 0..3 {
            middleware
                .execute(RequestInfo::new("events", "GET"), || async { Ok(0u8) })
                .await
                .unwrap();
        }
        let seen = capture.seen.lock().unwrap();
        assert_ne!(seen[0].operation_id, seen[1].operation_id);
        assert_ne!(seen[1].operation_id, seen[2].operation_id);
    }
}
