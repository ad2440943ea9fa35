//! Errors raised by observer interceptors.
//!
//! These never leave the pipeline: a failing interceptor is logged and the
//! chain moves on.

use rampart_core::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterceptorError {
    #[error("Interceptor {interceptor} failed: {reason}")]
    Failed { interceptor: String, reason: String },

    #[error("Interceptor storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl InterceptorError {
    pub fn failed(interceptor: &str, reason: impl Into<String>) -> Self {
        Self::Failed {
            interceptor: interceptor.to_string(),
            reason: reason.into(),
        }
    }
}
