//! Wall-clock abstraction.
//!
//! TTLs and rate-limit windows are measured against a [`Clock`] so tests can
//! move time forward without sleeping.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The real UTC clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start the clock at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Start the clock at the current wall-clock time, truncated to whole
    /// milliseconds to match persisted timestamps.
    pub fn starting_now() -> Self {
        let now = Utc::now();
        Self::new(DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::milliseconds(by.as_millis() as i64);
        if let Ok(mut now) = self.now.write() {
            *now += delta;
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_now()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

/// Non-negative duration between two instants.
pub fn elapsed_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    later
        .signed_duration_since(earlier)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
