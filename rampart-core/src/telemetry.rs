//! Tracing subscriber setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ConfigError, RampartResult};

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive, e.g. `info` or `rampart_middleware=debug`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init_tracing(config: &TelemetryConfig) -> RampartResult<()> {
    let filter = EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
        field: "telemetry.filter".to_string(),
        value: config.filter.clone(),
        reason: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }

    Ok(())
}
