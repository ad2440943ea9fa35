//! RAMPART Core - Shared Types and Contracts
//!
//! Everything the resilience layer needs to agree on lives here:
//! - the error taxonomy ([`OperationError`], [`ErrorKind`], [`RampartError`])
//! - the clock abstraction used for TTLs and rate-limit windows
//! - the collaborator contracts (notification sink, session hook, connectivity)
//! - configuration and tracing setup
//!
//! This crate contains no caching or pipeline logic.

pub mod clock;
pub mod config;
pub mod error;
pub mod failure;
pub mod notify;
pub mod telemetry;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub use clock::{elapsed_between, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    BackendKind, CacheSettings, DedupConfig, MiddlewareSettings, RampartConfig, RateLimitConfig,
    RateLimitRule, RetryConfig,
};
pub use error::{ConfigError, RampartError, RampartResult, StorageError};
pub use failure::{ErrorKind, OperationError};
pub use notify::{
    AlwaysOnline, Connectivity, ConnectivityFlag, NoopSession, Notifier, SessionHook, Severity,
    SilentNotifier, TracingNotifier,
};
pub use telemetry::{init_tracing, TelemetryConfig};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Number of hex characters kept from the content digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Compute a short content fingerprint.
///
/// Truncated SHA-256, hex encoded. Good enough to notice that a payload
/// changed; not meant as an integrity check.
pub fn compute_fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let a = compute_fingerprint(br#"[{"id":"e1"}]"#);
        let b = compute_fingerprint(br#"[{"id":"e1"}]"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = compute_fingerprint(b"one");
        let b = compute_fingerprint(b"two");
        assert_ne!(a, b);
    }
}
