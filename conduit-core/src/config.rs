//! Pipeline configuration.
//!
//! Every knob of the built-in middleware in one serde-friendly tree, loaded
//! from JSON or from `CONDUIT_*` environment variables. Durations are in
//! milliseconds.

use crate::event_bus::EventBusConfig;
use crate::logging::{LogConfig, LogLevel};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Prefix of the environment variables read by [`PipelineConfig::from_env`].
pub const ENV_PREFIX: &str = "CONDUIT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value '{value}' for environment variable {var}")]
    Env { var: String, value: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Retry backoff settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Each delay is scaled by a random factor in `1 ± jitter_fraction`
    pub jitter_fraction: f64,
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter_fraction: 0.1,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a probe
    pub reset_timeout_ms: u64,
    /// Concurrent probes admitted while half-open
    pub half_open_max_probes: u32,
}

impl CircuitBreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout_ms: 30_000,
            half_open_max_probes: 1,
        }
    }
}

/// Idempotency and query cache settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// How long a successful idempotent result is replayed
    pub idempotency_ttl_ms: u64,
    /// TTL for queries that do not declare their own
    pub query_ttl_ms: u64,
}

impl CacheSettings {
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotency_ttl_ms)
    }

    pub fn query_ttl(&self) -> Duration {
        Duration::from_millis(self.query_ttl_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            idempotency_ttl_ms: 24 * 60 * 60 * 1000,
            query_ttl_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Stop at the first validator that reports errors
    pub fail_fast: bool,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub cache: CacheSettings,
    pub validation: ValidationSettings,
    pub event_bus: EventBusConfig,
    pub logging: LogConfig,
}

impl PipelineConfig {
    /// Parse and validate a JSON document. Missing sections take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Defaults overridden by `CONDUIT_*` process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by `CONDUIT_*` entries of `vars`.
    ///
    /// Keys are matched after stripping the prefix, case-insensitively:
    /// `CONDUIT_RETRY_MAX_ATTEMPTS=5` sets `retry.max_attempts`.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = format!("{}_", ENV_PREFIX);
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|rest| (rest.to_lowercase(), value))
            })
            .collect();

        let mut config = Self::default();
        let retry = &mut config.retry;
        read(&vars, "retry_max_attempts", &mut retry.max_attempts)?;
        read(&vars, "retry_base_delay_ms", &mut retry.base_delay_ms)?;
        read(&vars, "retry_multiplier", &mut retry.multiplier)?;
        read(&vars, "retry_max_delay_ms", &mut retry.max_delay_ms)?;
        read(&vars, "retry_jitter_fraction", &mut retry.jitter_fraction)?;

        let breaker = &mut config.circuit_breaker;
        read(&vars, "breaker_failure_threshold", &mut breaker.failure_threshold)?;
        read(&vars, "breaker_success_threshold", &mut breaker.success_threshold)?;
        read(&vars, "breaker_reset_timeout_ms", &mut breaker.reset_timeout_ms)?;
        read(&vars, "breaker_half_open_max_probes", &mut breaker.half_open_max_probes)?;

        read(&vars, "idempotency_ttl_ms", &mut config.cache.idempotency_ttl_ms)?;
        read(&vars, "query_cache_ttl_ms", &mut config.cache.query_ttl_ms)?;
        read(&vars, "validation_fail_fast", &mut config.validation.fail_fast)?;
        read(&vars, "events_concurrent", &mut config.event_bus.concurrent)?;
        read(&vars, "events_raise_on_error", &mut config.event_bus.raise_on_error)?;

        let mut level: Option<LogLevel> = None;
        read_into(&vars, "log_level", &mut level)?;
        if let Some(level) = level {
            config.logging.level = level;
        }
        if let Some(filter) = vars.get("log_filter") {
            config.logging.env_filter = Some(filter.clone());
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be a finite number >= 1.0"));
        }
        if !(0.0..=1.0).contains(&retry.jitter_fraction) {
            return Err(invalid("retry.jitter_fraction", "must be within 0.0..=1.0"));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms", "must not be below base_delay_ms"));
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if breaker.success_threshold == 0 {
            return Err(invalid("circuit_breaker.success_threshold", "must be at least 1"));
        }
        if breaker.half_open_max_probes == 0 {
            return Err(invalid(
                "circuit_breaker.half_open_max_probes",
                "must be at least 1",
            ));
        }

        if self.cache.idempotency_ttl_ms == 0 {
            return Err(invalid("cache.idempotency_ttl_ms", "must be positive"));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn read<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str, slot: &mut T) -> Result<()> {
    if let Some(raw) = vars.get(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::Env {
            var: format!("{}_{}", ENV_PREFIX, key.to_uppercase()),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

fn read_into<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    slot: &mut Option<T>,
) -> Result<()> {
    if let Some(raw) = vars.get(key) {
        let parsed = raw.trim().parse().map_err(|_| ConfigError::Env {
            var: format!("{}_{}", ENV_PREFIX, key.to_uppercase()),
            value: raw.clone(),
        })?;
        *slot = Some(parsed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.half_open_max_probes, 1);
        assert!(!config.event_bus.raise_on_error);
    }

    #[test]
    fn test_from_json_partial() {
        let config = PipelineConfig::from_json(
            r#"{
                "retry": { "max_attempts": 5, "base_delay_ms": 50 },
                "circuit_breaker": { "failure_threshold": 2, "reset_timeout_ms": 1000 },
                "event_bus": { "raise_on_error": true },
                "logging": { "level": "debug" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay(), Duration::from_millis(50));
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.circuit_breaker.reset_timeout(), Duration::from_secs(1));
        assert!(config.event_bus.raise_on_error);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_from_json_rejects_out_of_range() {
        let err = PipelineConfig::from_json(r#"{ "retry": { "jitter_fraction": 1.5 } }"#)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "retry.jitter_fraction",
                ..
            }
        ));

        assert!(matches!(
            PipelineConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_vars() {
        let config = PipelineConfig::from_vars(vars(&[
            ("CONDUIT_RETRY_MAX_ATTEMPTS", "4"),
            ("CONDUIT_BREAKER_RESET_TIMEOUT_MS", "2500"),
            ("CONDUIT_EVENTS_CONCURRENT", "true"),
            ("CONDUIT_LOG_LEVEL", "warn"),
            ("UNRELATED_RETRY_MAX_ATTEMPTS", "99"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 2500);
        assert!(config.event_bus.concurrent);
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn test_from_vars_reports_bad_value() {
        let err = PipelineConfig::from_vars(vars(&[("CONDUIT_RETRY_MULTIPLIER", "fast")]))
            .unwrap_err();

        match err {
            ConfigError::Env { var, value } => {
                assert_eq!(var, "CONDUIT_RETRY_MULTIPLIER");
                assert_eq!(value, "fast");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            PipelineConfig::from_file("/nonexistent/conduit.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
