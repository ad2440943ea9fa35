//! Interceptor traits and the chains that run them.
//!
//! Two kinds of stage exist:
//! - [`RequestChain`]: runs before the operation; any interceptor may reject
//!   the call with a terminal [`OperationError`].
//! - [`ObserverChain`]: runs after the operation; each interceptor is
//!   isolated, so one failing never stops the rest.
//!
//! Interceptors run in registration order. Observers may annotate the
//! context, but the response and classification each one sees are the ones
//! the pipeline recorded.

use std::sync::Arc;

use async_trait::async_trait;
use rampart_core::{ErrorKind, OperationError};

use crate::context::{MiddlewareContext, ResponseInfo};
use crate::error::InterceptorError;

/// Runs before the operation. Returning `Err` rejects the call.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut MiddlewareContext) -> Result<(), OperationError>;
}

/// Observes a successful call.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_response(&self, ctx: &mut MiddlewareContext) -> Result<(), InterceptorError>;
}

/// Observes a failed call. The failure is available as `ctx.error()`.
#[async_trait]
pub trait ErrorInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_error(&self, ctx: &mut MiddlewareContext) -> Result<(), InterceptorError>;
}

// ============================================================================
// REQUEST CHAIN
// ============================================================================

/// Ordered request interceptors; stops at the first rejection.
#[derive(Default, Clone)]
pub struct RequestChain {
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
}

impl RequestChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub async fn run(&self, ctx: &mut MiddlewareContext) -> Result<(), OperationError> {
        for interceptor in &self.interceptors {
            if let Err(rejection) = interceptor.on_request(ctx).await {
                tracing::debug!(
                    operation_id = %ctx.operation_id,
                    interceptor = interceptor.name(),
                    error = %rejection,
                    "request rejected"
                );
                return Err(rejection);
            }
        }
        Ok(())
    }
}

// ============================================================================
// OBSERVER CHAIN
// ============================================================================

/// Ordered observer interceptors with per-interceptor isolation.
pub struct ObserverChain<I: ?Sized> {
    interceptors: Vec<Arc<I>>,
}

impl<I: ?Sized> Default for ObserverChain<I> {
    fn default() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }
}

impl<I: ?Sized> Clone for ObserverChain<I> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<I: ?Sized> ObserverChain<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<I>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

fn log_observer_failure(ctx: &MiddlewareContext, name: &'static str, error: &InterceptorError) {
    tracing::warn!(
        operation_id = %ctx.operation_id,
        target = %ctx.request.target,
        interceptor = name,
        error = %error,
        "interceptor failed; continuing"
    );
}

/// The outcome fields as the pipeline recorded them.
struct RecordedOutcome {
    response: Option<ResponseInfo>,
    classification: Option<ErrorKind>,
}

impl RecordedOutcome {
    fn capture(ctx: &MiddlewareContext) -> Self {
        Self {
            response: ctx.response.clone(),
            classification: ctx.classification,
        }
    }

    fn restore(&self, ctx: &mut MiddlewareContext) {
        ctx.response = self.response.clone();
        ctx.classification = self.classification;
    }
}

impl ObserverChain<dyn ResponseInterceptor> {
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub async fn run(&self, ctx: &mut MiddlewareContext) {
        let recorded = RecordedOutcome::capture(ctx);
        for interceptor in &self.interceptors {
            recorded.restore(ctx);
            if let Err(e) = interceptor.on_response(ctx).await {
                log_observer_failure(ctx, interceptor.name(), &e);
            }
        }
        recorded.restore(ctx);
    }
}

impl ObserverChain<dyn ErrorInterceptor> {
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub async fn run(&self, ctx: &mut MiddlewareContext) {
        let recorded = RecordedOutcome::capture(ctx);
        for interceptor in &self.interceptors {
            recorded.restore(ctx);
            if let Err(e) = interceptor.on_error(ctx).await {
                log_observer_failure(ctx, interceptor.name(), &e);
            }
        }
        recorded.restore(ctx);
    }
}

pub type ResponseChain = ObserverChain<dyn ResponseInterceptor>;
pub type ErrorChain = ObserverChain<dyn ErrorInterceptor>;
