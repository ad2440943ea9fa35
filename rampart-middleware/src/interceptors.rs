//! Interceptors installed on every pipeline.
//!
//! Request: [`RequestLogger`], then the rate limiter.
//! Response: [`ResponseLogger`].
//! Error: [`ErrorLogger`], [`AuthErrorHandler`], [`ErrorNotifier`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rampart_core::{Connectivity, ErrorKind, Notifier, OperationError, SessionHook, Severity};

use crate::chain::{ErrorInterceptor, RequestInterceptor, ResponseInterceptor};
use crate::context::MiddlewareContext;
use crate::error::InterceptorError;

// ============================================================================
// LOGGING
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger;

#[async_trait]
impl RequestInterceptor for RequestLogger {
    fn name(&self) -> &'static str {
        "request_logger"
    }

    async fn on_request(&self, ctx: &mut MiddlewareContext) -> Result<(), OperationError> {
        tracing::debug!(
            operation_id = %ctx.operation_id,
            target = %ctx.request.target,
            method = %ctx.request.method,
            actor = ctx.request.actor.as_deref(),
            retry_count = ctx.retry_count,
            "request started"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseLogger;

#[async_trait]
impl ResponseInterceptor for ResponseLogger {
    fn name(&self) -> &'static str {
        "response_logger"
    }

    async fn on_response(&self, ctx: &mut MiddlewareContext) -> Result<(), InterceptorError> {
        let duration_ms = ctx.duration().map(|d| d.as_millis() as u64).unwrap_or(0);
        tracing::debug!(
            operation_id = %ctx.operation_id,
            target = %ctx.request.target,
            method = %ctx.request.method,
            duration_ms,
            "request completed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorLogger;

#[async_trait]
impl ErrorInterceptor for ErrorLogger {
    fn name(&self) -> &'static str {
        "error_logger"
    }

    async fn on_error(&self, ctx: &mut MiddlewareContext) -> Result<(), InterceptorError> {
        let Some(error) = ctx.error() else {
            return Err(InterceptorError::failed(self.name(), "no error in context"));
        };
        let kind = ctx.classification.unwrap_or_else(|| error.kind());
        let duration_ms = ctx.duration().map(|d| d.as_millis() as u64).unwrap_or(0);

        match kind {
            ErrorKind::Server | ErrorKind::Unknown => tracing::error!(
                operation_id = %ctx.operation_id,
                target = %ctx.request.target,
                method = %ctx.request.method,
                kind = %kind,
                status = error.status(),
                code = error.code(),
                duration_ms,
                error = %error,
                "request failed"
            ),
            _ => tracing::warn!(
                operation_id = %ctx.operation_id,
                target = %ctx.request.target,
                method = %ctx.request.method,
                kind = %kind,
                status = error.status(),
                code = error.code(),
                duration_ms,
                error = %error,
                "request failed"
            ),
        }
        Ok(())
    }
}

// ============================================================================
// AUTH FAILURES
// ============================================================================

/// On an auth failure: clear credentials now, redirect to sign-in after a
/// short delay so the user can read the notification.
pub struct AuthErrorHandler {
    session: Arc<dyn SessionHook>,
    redirect_delay: Duration,
}

impl AuthErrorHandler {
    pub fn new(session: Arc<dyn SessionHook>, redirect_delay: Duration) -> Self {
        Self {
            session,
            redirect_delay,
        }
    }
}

#[async_trait]
impl ErrorInterceptor for AuthErrorHandler {
    fn name(&self) -> &'static str {
        "auth_error_handler"
    }

    async fn on_error(&self, ctx: &mut MiddlewareContext) -> Result<(), InterceptorError> {
        if ctx.classification != Some(ErrorKind::Auth) {
            return Ok(());
        }
        tracing::info!(
            operation_id = %ctx.operation_id,
            target = %ctx.request.target,
            redirect_delay_ms = self.redirect_delay.as_millis() as u64,
            "auth failure; clearing session"
        );
        self.session.clear_credentials();

        let session = self.session.clone();
        let delay = self.redirect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            session.redirect_to_sign_in();
        });
        ctx.insert_metadata("sign_in_redirect_scheduled", true);
        Ok(())
    }
}

// ============================================================================
// USER NOTIFICATION
// ============================================================================

/// Message shown when a network failure happens while offline.
pub const OFFLINE_NOTICE: &str = "No internet connection. Check your connection and try again.";

/// One classified user notification per failed call, unless the request is
/// silent.
pub struct ErrorNotifier {
    notifier: Arc<dyn Notifier>,
    connectivity: Arc<dyn Connectivity>,
}

impl ErrorNotifier {
    pub fn new(notifier: Arc<dyn Notifier>, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            notifier,
            connectivity,
        }
    }
}

/// User-facing message and severity for a classified failure.
pub fn notification_for(kind: ErrorKind, error: &OperationError, online: bool) -> (String, Severity) {
    match kind {
        ErrorKind::Network if !online => (OFFLINE_NOTICE.to_string(), Severity::Warn),
        ErrorKind::Network => (
            "Network error. Please try again.".to_string(),
            Severity::Warn,
        ),
        ErrorKind::Timeout => (
            "The request timed out. Please try again.".to_string(),
            Severity::Warn,
        ),
        ErrorKind::Server => (
            "Something went wrong on our end. Please try again later.".to_string(),
            Severity::Error,
        ),
        ErrorKind::Validation => (error.message().to_string(), Severity::Warn),
        ErrorKind::Auth => (
            "Your session has expired. Please sign in again.".to_string(),
            Severity::Warn,
        ),
        ErrorKind::RateLimited => {
            let message = match error.retry_after() {
                Some(wait) => format!(
                    "Too many requests. Try again in {} seconds.",
                    wait.as_secs().max(1)
                ),
                None => "Too many requests. Please wait a moment.".to_string(),
            };
            (message, Severity::Warn)
        }
        ErrorKind::Unknown => (
            "An unexpected error occurred.".to_string(),
            Severity::Error,
        ),
    }
}

#[async_trait]
impl ErrorInterceptor for ErrorNotifier {
    fn name(&self) -> &'static str {
        "error_notifier"
    }

    async fn on_error(&self, ctx: &mut MiddlewareContext) -> Result<(), InterceptorError> {
        if ctx.request.silent {
            return Ok(());
        }
        let Some(error) = ctx.error() else {
            return Err(InterceptorError::failed(self.name(), "no error in context"));
        };
        let kind = ctx.classification.unwrap_or_else(|| error.kind());
        let (message, severity) = notification_for(kind, error, self.connectivity.is_online());
        self.notifier.notify(&message, severity);
        ctx.insert_metadata("notified", true);
        Ok(())
    }
}
