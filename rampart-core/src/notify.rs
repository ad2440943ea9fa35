//! Contracts for the collaborators the resilience layer talks to.
//!
//! None of these may fail back into the pipeline: every method returns `()`
//! and implementations are expected to swallow their own problems.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Severity of a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Warn => f.write_str("warn"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Fire-and-forget user notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Notifier that writes messages to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!(target: "rampart::notify", "{message}"),
            Severity::Warn => tracing::warn!(target: "rampart::notify", "{message}"),
            Severity::Error => tracing::error!(target: "rampart::notify", "{message}"),
        }
    }
}

/// Notifier that drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn notify(&self, _message: &str, _severity: Severity) {}
}

/// Session hooks invoked when a call fails authentication.
pub trait SessionHook: Send + Sync {
    /// Forget the current session's credentials.
    fn clear_credentials(&self);

    /// Navigate to the sign-in entry point.
    fn redirect_to_sign_in(&self);
}

/// Session hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSession;

impl SessionHook for NoopSession {
    fn clear_credentials(&self) {}

    fn redirect_to_sign_in(&self) {}
}

/// Connectivity probe.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Probe that always reports online.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Probe backed by a flag the host flips on connectivity events.
#[derive(Debug)]
pub struct ConnectivityFlag {
    online: AtomicBool,
}

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_flag_toggles() {
        let flag = ConnectivityFlag::default();
        assert!(flag.is_online());
        flag.set_online(false);
        assert!(!flag.is_online());
        flag.set_online(true);
        assert!(flag.is_online());
    }

    #[test]
    fn test_severity_display_and_serde() {
        assert_eq!(Severity::Warn.to_string(), "warn");
        assert_eq!(serde_json::to_string(&Severity::Error).unwrap(), "\"error\"");
    }
}
