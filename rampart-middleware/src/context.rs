//! Per-call context threaded through every interceptor phase.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use rampart_core::{ErrorKind, OperationError, Timestamp};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Description of the call being wrapped.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInfo {
    /// Logical destination, e.g. `events` or `orders/42`. Also the
    /// rate-limit bucket.
    pub target: String,
    /// Verb, e.g. `GET` or `create`.
    pub method: String,
    pub payload: Option<Value>,
    /// Who is making the call, if known.
    pub actor: Option<String>,
    /// Set by the pipeline when the call is created.
    pub started_at: Timestamp,
    /// Suppress user notifications for this call.
    pub silent: bool,
    /// Attempts made before this one.
    pub retry_count: u32,
}

impl RequestInfo {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            payload: None,
            actor: None,
            started_at: Utc::now(),
            silent: false,
            retry_count: 0,
        }
    }

    /// Attach a payload snapshot. Values that fail to serialize are dropped.
    pub fn with_payload<P: Serialize>(mut self, payload: &P) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Coarse outcome class of a finished call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Success,
    /// Failure with a 4xx-style status.
    ClientError,
    /// Failure with a 5xx-style status.
    ServerError,
    /// Failure without a usable status.
    Failed,
}

impl StatusClass {
    fn of_error(error: &OperationError) -> Self {
        match error.status() {
            Some(400..=499) => Self::ClientError,
            Some(500..=599) => Self::ServerError,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::ClientError => f.write_str("client_error"),
            Self::ServerError => f.write_str("server_error"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// What happened once the call finished.
///
/// Exactly one of `payload` and `error` is meaningful: constructors enforce
/// it.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    status_class: StatusClass,
    payload: Option<Value>,
    error: Option<OperationError>,
    duration: Duration,
}

impl ResponseInfo {
    pub fn success(payload: Option<Value>, duration: Duration) -> Self {
        Self {
            status_class: StatusClass::Success,
            payload,
            error: None,
            duration,
        }
    }

    pub fn failure(error: OperationError, duration: Duration) -> Self {
        Self {
            status_class: StatusClass::of_error(&error),
            payload: None,
            error: Some(error),
            duration,
        }
    }

    pub fn status_class(&self) -> StatusClass {
        self.status_class
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn error(&self) -> Option<&OperationError> {
        self.error.as_ref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// State shared by all interceptors of one call.
#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    pub operation_id: Uuid,
    pub request: RequestInfo,
    pub response: Option<ResponseInfo>,
    pub retry_count: u32,
    /// Set once, before the error phase.
    pub classification: Option<ErrorKind>,
    /// Free-form notes interceptors leave for each other.
    pub metadata: HashMap<String, Value>,
}

impl MiddlewareContext {
    pub fn new(mut request: RequestInfo, started_at: Timestamp) -> Self {
        request.started_at = started_at;
        Self {
            operation_id: Uuid::now_v7(),
            retry_count: request.retry_count,
            request,
            response: None,
            classification: None,
            metadata: HashMap::new(),
        }
    }

    /// The failure under way, if the call is in its error phase.
    pub fn error(&self) -> Option<&OperationError> {
        self.response.as_ref().and_then(ResponseInfo::error)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.response.as_ref().map(ResponseInfo::duration)
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }
}
