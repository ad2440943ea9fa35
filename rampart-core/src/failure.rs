//! Operation failures and their classification.
//!
//! Wrapped operations fail with an [`OperationError`], which may carry a
//! status-like number and a `code` string. [`ErrorKind::classify`] turns
//! that information into one of seven categories that drive the
//! middleware's side effects.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR KIND
// ============================================================================

/// Failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Transport or connectivity failure.
    Network,
    /// The operation reported that it timed out.
    Timeout,
    /// Remote fault (5xx equivalent).
    Server,
    /// Caller input rejected (4xx equivalent).
    Validation,
    /// Unauthenticated or unauthorized.
    Auth,
    /// Too many requests, either locally or remotely enforced.
    RateLimited,
    /// No usable status or code information.
    Unknown,
}

const NETWORK_CODES: &[&str] = &[
    "NETWORK_ERROR",
    "ERR_NETWORK",
    "ECONNREFUSED",
    "ECONNRESET",
    "ENOTFOUND",
    "EAI_AGAIN",
    "OFFLINE",
];

const TIMEOUT_CODES: &[&str] = &["TIMEOUT", "ETIMEDOUT", "ECONNABORTED"];

const AUTH_CODES: &[&str] = &[
    "UNAUTHENTICATED",
    "UNAUTHORIZED",
    "FORBIDDEN",
    "INVALID_JWT",
    "PGRST301",
];

const VALIDATION_CODES: &[&str] = &["VALIDATION", "INVALID_INPUT", "BAD_REQUEST"];

impl ErrorKind {
    /// Classify a failure. Status information wins over the code.
    pub fn classify(error: &OperationError) -> Self {
        error
            .status()
            .and_then(Self::from_status)
            .or_else(|| error.code().and_then(Self::from_code))
            .unwrap_or(Self::Unknown)
    }

    /// Map a status-like number onto a category.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 | 403 => Some(Self::Auth),
            408 | 504 => Some(Self::Timeout),
            429 => Some(Self::RateLimited),
            500..=599 => Some(Self::Server),
            400..=499 => Some(Self::Validation),
            _ => None,
        }
    }

    /// Map an error code onto a category (case-insensitive).
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim().to_ascii_uppercase();
        let code = code.as_str();
        if NETWORK_CODES.contains(&code) {
            Some(Self::Network)
        } else if TIMEOUT_CODES.contains(&code) {
            Some(Self::Timeout)
        } else if code == "RATE_LIMITED" {
            Some(Self::RateLimited)
        } else if AUTH_CODES.contains(&code) {
            Some(Self::Auth)
        } else if VALIDATION_CODES.contains(&code) {
            Some(Self::Validation)
        } else {
            None
        }
    }

    /// Whether repeating the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::Server | Self::RateLimited
        )
    }

    /// Stable upper-case name, as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::Server => "SERVER",
            Self::Validation => "VALIDATION",
            Self::Auth => "AUTH",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// OPERATION ERROR
// ============================================================================

/// Failure reported by a wrapped operation.
///
/// Cloneable so a single failure can be handed to every caller waiting on
/// a deduplicated call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct OperationError {
    message: String,
    status: Option<u16>,
    code: Option<String>,
    retry_after: Option<Duration>,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl OperationError {
    /// Create an error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
            retry_after: None,
            source: None,
        }
    }

    /// Transport failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(message).with_code("NETWORK_ERROR")
    }

    /// Self-reported timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message).with_code("TIMEOUT")
    }

    /// Local rate-limit rejection for `target`.
    pub fn rate_limited(target: &str, retry_after: Duration) -> Self {
        Self::new(format!("Rate limit exceeded for {target}"))
            .with_status(429)
            .with_code("RATE_LIMITED")
            .with_retry_after(retry_after)
    }

    /// The call that owned a deduplicated operation went away before
    /// publishing an outcome.
    pub fn abandoned(key: &str) -> Self {
        Self::new(format!("Operation {key} was abandoned before completing"))
            .with_code("ABANDONED")
    }

    /// Attach a status-like number.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a retry hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Classify this failure.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::classify(self)
    }
}

impl PartialEq for OperationError {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
            && self.status == other.status
            && self.code == other.code
            && self.retry_after == other.retry_after
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_status_classification() {
        let cases = [
            (401, ErrorKind::Auth),
            (403, ErrorKind::Auth),
            (408, ErrorKind::Timeout),
            (504, ErrorKind::Timeout),
            (429, ErrorKind::RateLimited),
            (500, ErrorKind::Server),
            (503, ErrorKind::Server),
            (400, ErrorKind::Validation),
            (422, ErrorKind::Validation),
        ];
        for (status, expected) in cases {
            let err = OperationError::new("failed").with_status(status);
            assert_eq!(err.kind(), expected, "status {status}");
        }
    }

    #[test]
    fn test_code_classification_is_case_insensitive() {
        assert_eq!(
            OperationError::new("x").with_code("econnrefused").kind(),
            ErrorKind::Network
        );
        assert_eq!(
            OperationError::new("x").with_code("ETIMEDOUT").kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            OperationError::new("x").with_code("PGRST301").kind(),
            ErrorKind::Auth
        );
    }

    #[test]
    fn test_status_wins_over_code() {
        let err = OperationError::new("x")
            .with_status(503)
            .with_code("UNAUTHENTICATED");
        assert_eq!(err.kind(), ErrorKind::Server);
    }

    #[test]
    fn test_missing_information_is_unknown() {
        assert_eq!(OperationError::new("x").kind(), ErrorKind::Unknown);
        assert_eq!(
            OperationError::new("x").with_status(302).kind(),
            ErrorKind::Unknown
        );
        assert_eq!(
            OperationError::new("x").with_code("SOMETHING_ELSE").kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_constructors() {
        assert_eq!(OperationError::network("down").kind(), ErrorKind::Network);
        assert_eq!(OperationError::timeout("slow").kind(), ErrorKind::Timeout);

        let limited = OperationError::rate_limited("events.list", Duration::from_secs(3));
        assert_eq!(limited.kind(), ErrorKind::RateLimited);
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert!(limited.to_string().contains("events.list"));

        let abandoned = OperationError::abandoned("get:events:1");
        assert_eq!(abandoned.code(), Some("ABANDONED"));
        assert_eq!(abandoned.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_source_is_exposed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = OperationError::network("socket closed").with_source(io);
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Network.is_transient());
        assert!(ErrorKind::Server.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
        assert!(!ErrorKind::Auth.is_transient());
    }

    #[test]
    fn test_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"RATE_LIMITED\"");
    }

    proptest! {
        #[test]
        fn prop_every_5xx_is_server_except_gateway_timeout(status in 500u16..600) {
            let kind = OperationError::new("x").with_status(status).kind();
            if status == 504 {
                prop_assert_eq!(kind, ErrorKind::Timeout);
            } else {
                prop_assert_eq!(kind, ErrorKind::Server);
            }
        }
    }
}
