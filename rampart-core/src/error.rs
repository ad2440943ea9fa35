//! Error types for RAMPART internals

use thiserror::Error;

use crate::failure::OperationError;

/// Storage backend errors.
///
/// These never reach callers of the cache store; the store logs them and
/// degrades to a miss or a no-op.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O failed at {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Quota exceeded: {needed} bytes needed, quota is {quota} bytes")]
    QuotaExceeded { needed: u64, quota: u64 },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Build an I/O error from a path and any displayable cause.
    pub fn io(path: impl AsRef<std::path::Path>, reason: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a transaction error from any displayable cause.
    pub fn transaction(reason: impl std::fmt::Display) -> Self {
        Self::TransactionFailed {
            reason: reason.to_string(),
        }
    }

    /// True when the failure is a capacity rejection that may succeed after
    /// freeing space.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(
        field: &str,
        value: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Master error type for RAMPART.
#[derive(Debug, Clone, Error)]
pub enum RampartError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation failed: {0}")]
    Operation(#[from] OperationError),
}

/// Result type alias for RAMPART operations.
pub type RampartResult<T> = Result<T, RampartError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_quota() {
        let err = StorageError::QuotaExceeded {
            needed: 6_000_000,
            quota: 5_242_880,
        };
        let msg = err.to_string();
        assert!(msg.contains("Quota exceeded"));
        assert!(msg.contains("6000000"));
        assert!(err.is_quota());
    }

    #[test]
    fn test_storage_error_io_helper() {
        let err = StorageError::io("/tmp/store.json", "permission denied");
        assert_eq!(
            err,
            StorageError::Io {
                path: "/tmp/store.json".to_string(),
                reason: "permission denied".to_string(),
            }
        );
        assert!(!err.is_quota());
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::invalid("rate_limit.window_ms", 0, "must be positive");
        let msg = err.to_string();
        assert!(msg.contains("rate_limit.window_ms"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_rampart_error_from_variants() {
        let storage = RampartError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, RampartError::Storage(_)));

        let config = RampartError::from(ConfigError::Parse {
            reason: "bad toml".to_string(),
        });
        assert!(matches!(config, RampartError::Config(_)));

        let operation = RampartError::from(OperationError::new("boom"));
        assert!(matches!(operation, RampartError::Operation(_)));
    }
}
