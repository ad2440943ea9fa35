//! RAMPART Middleware - Request Interceptor Pipeline
//!
//! Wraps arbitrary async operations with request, response and error
//! phases. Default interceptors log every call, enforce a persistent
//! sliding-window rate limit per target, clear the session on auth
//! failures, and raise exactly one classified user notification per failed
//! call.
//!
//! # Example
//!
//! ```ignore
//! let middleware = RequestMiddleware::builder()
//!     .notifier(notifier)
//!     .session(session)
//!     .rate_limiter(Arc::new(RateLimiter::new(flat_store, config.rate_limit)))
//!     .settings(config.middleware)
//!     .build();
//!
//! let events = middleware
//!     .execute(RequestInfo::new("events", "GET"), || api.list_events())
//!     .await?;
//! ```

pub mod chain;
pub mod context;
pub mod error;
pub mod interceptors;
pub mod middleware;
pub mod rate_limit;

pub use chain::{
    ErrorChain, ErrorInterceptor, ObserverChain, RequestChain, RequestInterceptor, ResponseChain,
    ResponseInterceptor,
};
pub use context::{MiddlewareContext, RequestInfo, ResponseInfo, StatusClass};
pub use error::InterceptorError;
pub use interceptors::{
    notification_for, AuthErrorHandler, ErrorLogger, ErrorNotifier, RequestLogger, ResponseLogger,
    OFFLINE_NOTICE,
};
pub use middleware::{CallPhase, RequestMiddleware, RequestMiddlewareBuilder};
pub use rate_limit::{RateDecision, RateLimitInterceptor, RateLimiter};
