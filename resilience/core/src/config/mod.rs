//! TOML Configuration File Support
//!
//! Configuration lives at `$XDG_CONFIG_HOME/resilience/resilience.toml`
//! (typically `~/.config/resilience/resilience.toml`).
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`RESILIENCE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [health]
//! cache_ttl_secs = 30
//! probe_timeout_ms = 5000
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout_secs = 60
//!
//! [alerts]
//! window_secs = 300
//! threshold = 3
//!
//! [monitoring]
//! history_limit = 1000
//! recovery_settle_ms = 1000
//! production = true
//!
//! [retry.llm]
//! max_attempts = 4
//! max_delay_ms = 20000
//!
//! [[dependencies]]
//! name = "cache-service"
//! class = "cache"
//! probe = "tcp"
//! target = "127.0.0.1:6379"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffMode;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dependency::DependencyClass;
use crate::error::ErrorCategory;
use crate::retry::RetryPolicy;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Where the configuration came from (highest layer that changed a value)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in default
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Structures
// =============================================================================

/// `[health]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Soft cache TTL in seconds
    pub cache_ttl_secs: Option<u64>,
    /// Per-probe timeout in milliseconds
    pub probe_timeout_ms: Option<u64>,
}

/// `[circuit_breaker]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerToml {
    /// Consecutive failures that open a breaker
    pub failure_threshold: Option<u32>,
    /// Seconds a breaker stays open
    pub recovery_timeout_secs: Option<u64>,
}

/// `[alerts]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsToml {
    /// Aggregation window in seconds
    pub window_secs: Option<u64>,
    /// Occurrences that mark a pattern
    pub threshold: Option<u32>,
}

/// `[monitoring]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringToml {
    /// Error history ring size
    pub history_limit: Option<usize>,
    /// Wait before a recovery re-probe, in milliseconds
    pub recovery_settle_ms: Option<u64>,
    /// Omit diagnostics from caller-facing errors
    pub production: Option<bool>,
}

/// `[retry.<class>]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Total attempts
    pub max_attempts: Option<u32>,
    /// First backoff in milliseconds
    pub base_delay_ms: Option<u64>,
    /// Growth factor
    pub factor: Option<f64>,
    /// Backoff cap in milliseconds
    pub max_delay_ms: Option<u64>,
    /// Jitter on/off
    pub jitter: Option<bool>,
    /// `exponential` or `linear`
    pub mode: Option<BackoffMode>,
    /// Retryable categories
    pub retryable: Option<Vec<ErrorCategory>>,
    /// Overall deadline in milliseconds
    pub deadline_ms: Option<u64>,
}

impl RetryToml {
    fn apply(&self, policy: &mut RetryPolicy) {
        if let Some(n) = self.max_attempts {
            policy.max_attempts = n;
        }
        if let Some(ms) = self.base_delay_ms {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(factor) = self.factor {
            policy.factor = factor;
        }
        if let Some(ms) = self.max_delay_ms {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(jitter) = self.jitter {
            policy.jitter = jitter;
        }
        if let Some(mode) = self.mode {
            policy.mode = mode;
        }
        if let Some(categories) = &self.retryable {
            policy.retryable = categories.iter().copied().collect();
        }
        if let Some(ms) = self.deadline_ms {
            policy.deadline = Some(Duration::from_millis(ms));
        }
    }
}

/// How the daemon probes a dependency
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// TCP connect
    Tcp,
    /// HTTP GET
    Http,
}

/// `[[dependencies]]`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Service name used as the health key
    pub name: String,
    /// Dependency class (selects the retry preset)
    #[serde(default)]
    pub class: Option<DependencyClass>,
    /// Probe type
    pub probe: ProbeKind,
    /// `host:port` for tcp, URL for http
    pub target: String,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceToml {
    /// Health section
    pub health: HealthToml,
    /// Circuit breaker section
    pub circuit_breaker: CircuitBreakerToml,
    /// Alerts section
    pub alerts: AlertsToml,
    /// Monitoring section
    pub monitoring: MonitoringToml,
    /// Per-class retry overrides
    pub retry: HashMap<DependencyClass, RetryToml>,
    /// Dependencies to watch
    pub dependencies: Vec<DependencyConfig>,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Health monitor settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthSettings {
    /// Soft cache TTL (hard ceiling is twice this)
    pub cache_ttl: Duration,
    /// Per-probe timeout
    pub probe_timeout: Duration,
}

/// Aggregator settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlertSettings {
    /// Sliding window
    pub window: Duration,
    /// Pattern threshold
    pub threshold: u32,
}

/// Monitoring service settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitoringSettings {
    /// History ring size
    pub history_limit: usize,
    /// Wait before recovery re-probes
    pub recovery_settle: Duration,
    /// Production rendering of caller-facing errors
    pub production: bool,
}

/// Fully resolved configuration
#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    /// Health monitor
    pub health: HealthSettings,
    /// Default breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,
    /// Aggregator
    pub alerts: AlertSettings,
    /// Monitoring service
    pub monitoring: MonitoringSettings,
    /// Retry policy per dependency class
    pub retry: HashMap<DependencyClass, RetryPolicy>,
    /// Dependencies to watch
    pub dependencies: Vec<DependencyConfig>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            health: HealthSettings {
                cache_ttl: Duration::from_secs(30),
                probe_timeout: Duration::from_millis(5000),
            },
            circuit_breaker: CircuitBreakerConfig::default(),
            alerts: AlertSettings {
                window: Duration::from_secs(300),
                threshold: 3,
            },
            monitoring: MonitoringSettings {
                history_limit: 1000,
                recovery_settle: Duration::from_millis(1000),
                production: false,
            },
            retry: DependencyClass::ALL.into_iter().map(|c| (c, c.preset())).collect(),
            dependencies: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ResilienceConfig {
    /// Defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest layer that changed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Retry policy for `class`
    #[must_use]
    pub fn retry_policy(&self, class: DependencyClass) -> RetryPolicy {
        self.retry.get(&class).cloned().unwrap_or_else(|| class.preset())
    }

    /// Reject values that would disable a mechanism outright
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.cache_ttl.is_zero() {
            return Err(ConfigError::ValidationError("health.cache_ttl_secs must be > 0".into()));
        }
        if self.health.probe_timeout.is_zero() {
            return Err(ConfigError::ValidationError("health.probe_timeout_ms must be > 0".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "circuit_breaker.failure_threshold must be > 0".into(),
            ));
        }
        if self.alerts.threshold == 0 {
            return Err(ConfigError::ValidationError("alerts.threshold must be > 0".into()));
        }
        if self.alerts.window.is_zero() {
            return Err(ConfigError::ValidationError("alerts.window_secs must be > 0".into()));
        }
        if self.monitoring.history_limit == 0 {
            return Err(ConfigError::ValidationError("monitoring.history_limit must be > 0".into()));
        }
        let mut classes: Vec<_> = self.retry.iter().collect();
        classes.sort_by_key(|(class, _)| **class);
        for (class, policy) in classes {
            if policy.max_attempts == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "retry.{class}.max_attempts must be > 0"
                )));
            }
            if !policy.factor.is_finite() || policy.factor < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "retry.{class}.factor must be a non-negative number"
                )));
            }
        }
        for dep in &self.dependencies {
            if dep.name.trim().is_empty() || dep.target.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "dependencies need a name and a target".into(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// `$XDG_CONFIG_HOME/resilience/resilience.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("resilience").join("resilience.toml"))
}

/// Load defaults, file and environment from the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// or if the result fails validation. A missing file is not an error.
pub fn load_config() -> Result<ResilienceConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load defaults, file (if `path` exists) and environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the result
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ResilienceConfig, ConfigError> {
    let mut config = ResilienceConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                path: config_path.clone(),
                source: e,
            })?;

            let toml_config: ResilienceToml = toml::from_str(&content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

/// Apply TOML values over `config`
pub fn apply_toml_config(config: &mut ResilienceConfig, toml: &ResilienceToml) {
    if let Some(secs) = toml.health.cache_ttl_secs {
        config.health.cache_ttl = Duration::from_secs(secs);
    }
    if let Some(ms) = toml.health.probe_timeout_ms {
        config.health.probe_timeout = Duration::from_millis(ms);
    }

    if let Some(threshold) = toml.circuit_breaker.failure_threshold {
        config.circuit_breaker.failure_threshold = threshold;
    }
    if let Some(secs) = toml.circuit_breaker.recovery_timeout_secs {
        config.circuit_breaker.recovery_timeout = Duration::from_secs(secs);
    }

    if let Some(secs) = toml.alerts.window_secs {
        config.alerts.window = Duration::from_secs(secs);
    }
    if let Some(threshold) = toml.alerts.threshold {
        config.alerts.threshold = threshold;
    }

    if let Some(limit) = toml.monitoring.history_limit {
        config.monitoring.history_limit = limit;
    }
    if let Some(ms) = toml.monitoring.recovery_settle_ms {
        config.monitoring.recovery_settle = Duration::from_millis(ms);
    }
    if let Some(production) = toml.monitoring.production {
        config.monitoring.production = production;
    }

    for (class, overrides) in &toml.retry {
        let policy = config.retry.entry(*class).or_insert_with(|| class.preset());
        overrides.apply(policy);
    }

    if !toml.dependencies.is_empty() {
        config.dependencies = toml.dependencies.clone();
    }
}

/// Apply `RESILIENCE_*` variables read through `lookup`
///
/// Unparseable values are ignored with a warning.
pub fn apply_env_config(config: &mut ResilienceConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
                None
            }
        }
    }

    if let Some(secs) = parsed::<u64>(&lookup, "RESILIENCE_HEALTH_TTL_SECS") {
        config.health.cache_ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed::<u64>(&lookup, "RESILIENCE_PROBE_TIMEOUT_MS") {
        config.health.probe_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed::<u32>(&lookup, "RESILIENCE_BREAKER_THRESHOLD") {
        config.circuit_breaker.failure_threshold = n;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "RESILIENCE_BREAKER_RECOVERY_SECS") {
        config.circuit_breaker.recovery_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "RESILIENCE_ALERT_WINDOW_SECS") {
        config.alerts.window = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed::<u32>(&lookup, "RESILIENCE_ALERT_THRESHOLD") {
        config.alerts.threshold = n;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed::<usize>(&lookup, "RESILIENCE_HISTORY_LIMIT") {
        config.monitoring.history_limit = n;
        config.source = ConfigSource::Env;
    }
    if let Some(raw) = lookup("RESILIENCE_PRODUCTION") {
        let raw = raw.trim().to_lowercase();
        config.monitoring.production = !(raw.is_empty() || raw == "0" || raw == "false");
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// CLI overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Cache TTL in seconds
    pub health_ttl_secs: Option<u64>,
    /// Probe timeout in milliseconds
    pub probe_timeout_ms: Option<u64>,
    /// Breaker failure threshold
    pub breaker_threshold: Option<u32>,
    /// Production rendering
    pub production: Option<bool>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the cache TTL
    #[must_use]
    pub fn with_health_ttl_secs(mut self, secs: u64) -> Self {
        self.health_ttl_secs = Some(secs);
        self
    }

    /// Override the probe timeout
    #[must_use]
    pub fn with_probe_timeout_ms(mut self, ms: u64) -> Self {
        self.probe_timeout_ms = Some(ms);
        self
    }

    /// Override the breaker threshold
    #[must_use]
    pub fn with_breaker_threshold(mut self, n: u32) -> Self {
        self.breaker_threshold = Some(n);
        self
    }

    /// Force production rendering on or off
    #[must_use]
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = Some(production);
        self
    }

    /// Apply to `config`, then re-validate
    ///
    /// # Errors
    ///
    /// Returns a validation error if an override produced an invalid value.
    pub fn apply(&self, config: &mut ResilienceConfig) -> Result<(), ConfigError> {
        let mut changed = false;
        if let Some(secs) = self.health_ttl_secs {
            config.health.cache_ttl = Duration::from_secs(secs);
            changed = true;
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.health.probe_timeout = Duration::from_millis(ms);
            changed = true;
        }
        if let Some(n) = self.breaker_threshold {
            config.circuit_breaker.failure_threshold = n;
            changed = true;
        }
        if let Some(production) = self.production {
            config.monitoring.production = production;
            changed = true;
        }
        if changed {
            config.source = ConfigSource::Cli;
        }
        config.validate()
    }
}
