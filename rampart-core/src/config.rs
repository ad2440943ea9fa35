//! Configuration types
//!
//! Every knob has a default that matches the behavior of the layer when no
//! configuration is supplied. Values can be overridden from TOML or from
//! `RAMPART_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::telemetry::TelemetryConfig;

// ============================================================================
// CACHE
// ============================================================================

/// Default TTL for cache entries (5 minutes).
pub const DEFAULT_EXPIRY_MS: u64 = 5 * 60 * 1000;

/// Default entry budget for the in-memory backend.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Default quota for the flat persistent backend (5 MiB).
pub const DEFAULT_FLAT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Which storage backend a cache store uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-lifetime map, bounded by `max_entries`.
    #[default]
    Memory,
    /// Single-file key-value store with a total-size quota.
    Flat { path: PathBuf, quota_bytes: u64 },
    /// LMDB environment with a lazily created `cache` database.
    Structured {
        path: PathBuf,
        app_name: String,
        map_size_mb: usize,
    },
}

/// Cache store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub default_expiry_ms: u64,
    pub max_entries: usize,
    pub backend: BackendKind,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_expiry_ms: DEFAULT_EXPIRY_MS,
            max_entries: DEFAULT_MAX_ENTRIES,
            backend: BackendKind::Memory,
        }
    }
}

impl CacheSettings {
    pub fn default_expiry(&self) -> Duration {
        Duration::from_millis(self.default_expiry_ms)
    }
}

// ============================================================================
// RATE LIMITING
// ============================================================================

/// A window/cap pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub window_ms: u64,
    pub max_requests: usize,
}

impl RateLimitRule {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Sliding-window rate limiting, per logical target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_requests: usize,
    /// Per-target rules that replace the defaults.
    pub overrides: HashMap<String, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            max_requests: 10,
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// The rule that applies to `target`.
    pub fn rule_for(&self, target: &str) -> RateLimitRule {
        self.overrides
            .get(target)
            .copied()
            .unwrap_or(RateLimitRule {
                window_ms: self.window_ms,
                max_requests: self.max_requests,
            })
    }

    /// Add a per-target override.
    pub fn with_override(mut self, target: impl Into<String>, rule: RateLimitRule) -> Self {
        self.overrides.insert(target.into(), rule);
        self
    }
}

// ============================================================================
// DEDUP / RETRY
// ============================================================================

/// In-flight deduplication windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long an entry is considered live after creation.
    pub window_ms: u64,
    /// Delay between settlement and removal. Defaults to twice the window.
    pub grace_ms: Option<u64>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            grace_ms: None,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms.unwrap_or(self.window_ms.saturating_mul(2)))
    }
}

/// Retry configuration for idempotent operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

// ============================================================================
// MIDDLEWARE
// ============================================================================

/// Request middleware settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareSettings {
    /// Delay before redirecting to sign-in after an auth failure, so the
    /// current notification can render.
    pub redirect_delay_ms: u64,
    /// Whether the default error notifier is installed.
    pub notify_errors: bool,
}

impl Default for MiddlewareSettings {
    fn default() -> Self {
        Self {
            redirect_delay_ms: 1_500,
            notify_errors: true,
        }
    }
}

impl MiddlewareSettings {
    pub fn redirect_delay(&self) -> Duration {
        Duration::from_millis(self.redirect_delay_ms)
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampartConfig {
    pub app_name: String,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitConfig,
    pub dedup: DedupConfig,
    pub retry: RetryConfig,
    pub middleware: MiddlewareSettings,
    pub telemetry: TelemetryConfig,
}

impl Default for RampartConfig {
    fn default() -> Self {
        Self {
            app_name: "rampart".to_string(),
            cache: CacheSettings::default(),
            rate_limit: RateLimitConfig::default(),
            dedup: DedupConfig::default(),
            retry: RetryConfig::default(),
            middleware: MiddlewareSettings::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl RampartConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `RAMPART_*` environment variables.
    ///
    /// Environment variables:
    /// - `RAMPART_APP_NAME`
    /// - `RAMPART_CACHE_DEFAULT_EXPIRY_MS`, `RAMPART_CACHE_MAX_ENTRIES`
    /// - `RAMPART_CACHE_BACKEND` (`memory`, `flat` or `structured`) with
    ///   `RAMPART_CACHE_PATH`, `RAMPART_CACHE_QUOTA_BYTES`, `RAMPART_CACHE_MAP_SIZE_MB`
    /// - `RAMPART_RATE_LIMIT_ENABLED`, `RAMPART_RATE_LIMIT_WINDOW_MS`, `RAMPART_RATE_LIMIT_MAX`
    /// - `RAMPART_DEDUP_WINDOW_MS`, `RAMPART_DEDUP_GRACE_MS`
    /// - `RAMPART_RETRY_MAX_ATTEMPTS`, `RAMPART_RETRY_INITIAL_BACKOFF_MS`, `RAMPART_RETRY_MAX_BACKOFF_MS`
    /// - `RAMPART_REDIRECT_DELAY_MS`, `RAMPART_NOTIFY_ERRORS`
    /// - `RAMPART_LOG`, `RAMPART_LOG_JSON`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`RampartConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("RAMPART_APP_NAME") {
            config.app_name = name;
        }

        set_parsed(&lookup, "RAMPART_CACHE_DEFAULT_EXPIRY_MS", &mut config.cache.default_expiry_ms)?;
        set_parsed(&lookup, "RAMPART_CACHE_MAX_ENTRIES", &mut config.cache.max_entries)?;
        if let Some(kind) = lookup("RAMPART_CACHE_BACKEND") {
            config.cache.backend = backend_from_env(&lookup, &kind, &config.app_name)?;
        }

        set_flag(&lookup, "RAMPART_RATE_LIMIT_ENABLED", &mut config.rate_limit.enabled);
        set_parsed(&lookup, "RAMPART_RATE_LIMIT_WINDOW_MS", &mut config.rate_limit.window_ms)?;
        set_parsed(&lookup, "RAMPART_RATE_LIMIT_MAX", &mut config.rate_limit.max_requests)?;

        set_parsed(&lookup, "RAMPART_DEDUP_WINDOW_MS", &mut config.dedup.window_ms)?;
        if let Some(raw) = lookup("RAMPART_DEDUP_GRACE_MS") {
            config.dedup.grace_ms = Some(parse_value("RAMPART_DEDUP_GRACE_MS", &raw)?);
        }

        set_parsed(&lookup, "RAMPART_RETRY_MAX_ATTEMPTS", &mut config.retry.max_attempts)?;
        set_parsed(&lookup, "RAMPART_RETRY_INITIAL_BACKOFF_MS", &mut config.retry.initial_backoff_ms)?;
        set_parsed(&lookup, "RAMPART_RETRY_MAX_BACKOFF_MS", &mut config.retry.max_backoff_ms)?;

        set_parsed(&lookup, "RAMPART_REDIRECT_DELAY_MS", &mut config.middleware.redirect_delay_ms)?;
        set_flag(&lookup, "RAMPART_NOTIFY_ERRORS", &mut config.middleware.notify_errors);

        if let Some(filter) = lookup("RAMPART_LOG") {
            config.telemetry.filter = filter;
        }
        set_flag(&lookup, "RAMPART_LOG_JSON", &mut config.telemetry.json);

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the layer misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.default_expiry_ms == 0 {
            return Err(ConfigError::invalid(
                "cache.default_expiry_ms",
                0,
                "must be positive",
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::invalid("cache.max_entries", 0, "must be positive"));
        }
        let rules = std::iter::once((
            "rate_limit".to_string(),
            self.rate_limit.rule_for(""),
        ))
        .chain(
            self.rate_limit
                .overrides
                .iter()
                .map(|(target, rule)| (format!("rate_limit.overrides.{target}"), *rule)),
        );
        for (field, rule) in rules {
            if rule.window_ms == 0 {
                return Err(ConfigError::invalid(
                    &format!("{field}.window_ms"),
                    0,
                    "must be positive",
                ));
            }
            if rule.max_requests == 0 {
                return Err(ConfigError::invalid(
                    &format!("{field}.max_requests"),
                    0,
                    "must be positive",
                ));
            }
        }
        if self.dedup.window_ms == 0 {
            return Err(ConfigError::invalid("dedup.window_ms", 0, "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", 0, "must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                self.retry.backoff_multiplier,
                "must be at least 1.0",
            ));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(name, raw, "not a valid number"))
}

fn set_parsed<F, T>(lookup: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_value(name, &raw)?;
    }
    Ok(())
}

fn set_flag<F>(lookup: &F, name: &str, slot: &mut bool)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw == "true" || raw == "1";
    }
}

fn backend_from_env<F>(lookup: &F, kind: &str, app_name: &str) -> Result<BackendKind, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let path = || {
        lookup("RAMPART_CACHE_PATH")
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::invalid("RAMPART_CACHE_PATH", "<unset>", "required for persistent backends"))
    };
    match kind.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(BackendKind::Memory),
        "flat" => {
            let mut quota_bytes = DEFAULT_FLAT_QUOTA_BYTES;
            set_parsed(lookup, "RAMPART_CACHE_QUOTA_BYTES", &mut quota_bytes)?;
            Ok(BackendKind::Flat {
                path: path()?,
                quota_bytes,
            })
        }
        "structured" => {
            let mut map_size_mb = 64usize;
            set_parsed(lookup, "RAMPART_CACHE_MAP_SIZE_MB", &mut map_size_mb)?;
            Ok(BackendKind::Structured {
                path: path()?,
                app_name: app_name.to_string(),
                map_size_mb,
            })
        }
        other => Err(ConfigError::invalid(
            "RAMPART_CACHE_BACKEND",
            other,
            "expected memory, flat or structured",
        )),
    }
}

// ============================================================================
// TESTS
// ============================================================================
