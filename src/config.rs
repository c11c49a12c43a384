//! Configuration for the data handler.
//!
//! Field names are snake_case; the camelCase names (`cacheMaxEntries`, ...)
//! are accepted as aliases so configs shared with other clients load as-is.
//!
//! # Example
//!
//! ```
//! use data_handler::HandlerConfig;
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults)
//! let config = HandlerConfig::default();
//! assert_eq!(config.cache_max_entries, 1000);
//! assert_eq!(config.debounce(), Duration::from_millis(250));
//!
//! // From TOML, either spelling
//! let config = HandlerConfig::from_toml_str(r#"
//!     cacheMaxEntries = 50
//!     debounce_ms = 100
//! "#).unwrap();
//! assert_eq!(config.cache_max_entries, 50);
//! assert_eq!(config.debounce_ms, 100);
//! ```

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::key::validate_namespace;
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::Backoff;
use crate::resilience::sync_queue::SyncQueueConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration for the data handler.
///
/// All fields have defaults; an empty config is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HandlerConfig {
    /// Max entries held by the memory cache (default: 1000)
    #[serde(default = "default_cache_max_entries", alias = "cacheMaxEntries")]
    pub cache_max_entries: usize,

    /// Cache entry lifetime; 0 disables expiry (default: 5 min)
    #[serde(default = "default_cache_ttl_ms", alias = "cacheTtlMs")]
    pub cache_ttl_ms: u64,

    /// Coalescing window for remote writes of one key (default: 250 ms)
    #[serde(default = "default_debounce_ms", alias = "debounceMs")]
    pub debounce_ms: u64,

    /// Consecutive remote failures that open the circuit (default: 5)
    #[serde(default = "default_circuit_threshold", alias = "circuitThreshold")]
    pub circuit_threshold: u32,

    #[serde(default = "default_circuit_cooldown_ms", alias = "circuitCooldownMs")]
    pub circuit_cooldown_ms: u64,

    /// Sync queue processing interval (default: 1 s)
    #[serde(default = "default_sync_interval_ms", alias = "syncIntervalMs")]
    pub sync_interval_ms: u64,

    /// Delivery attempts before an item is dead-lettered (default: 8)
    #[serde(default = "default_max_retry_attempts", alias = "maxRetryAttempts")]
    pub max_retry_attempts: u32,

    /// Upper bound on every remote call (default: 5 s)
    #[serde(default = "default_remote_timeout_ms", alias = "remoteTimeoutMs")]
    pub remote_timeout_ms: u64,

    #[serde(default = "default_health_interval_ms", alias = "healthIntervalMs")]
    pub health_interval_ms: u64,

    /// Backoff bounds for failed deliveries
    #[serde(default = "default_retry_base_delay_ms", alias = "retryBaseDelayMs")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms", alias = "retryMaxDelayMs")]
    pub retry_max_delay_ms: u64,

    /// Max items delivered per sync tick
    #[serde(default = "default_sync_batch_size", alias = "syncBatchSize")]
    pub sync_batch_size: usize,

    /// Samples kept per operation by the performance tracker
    #[serde(default = "default_latency_window", alias = "latencyWindow")]
    pub latency_window: usize,

    /// Separator of legacy `namespace<sep>field` record keys (default: "_")
    #[serde(default = "default_legacy_separator", alias = "legacySeparator")]
    pub legacy_separator: String,

    /// Namespaces legacy records are known to use; decides keys like
    /// `user_settings_theme` that split more than one way
    #[serde(default, alias = "legacyNamespaces")]
    pub legacy_namespaces: Vec<String>,

    /// Buffered events per subscriber before it starts lagging
    #[serde(default = "default_event_capacity", alias = "eventCapacity")]
    pub event_capacity: usize,
}

fn default_cache_max_entries() -> usize { 1000 }
fn default_cache_ttl_ms() -> u64 { 5 * 60 * 1000 } // 5 min
fn default_debounce_ms() -> u64 { 250 }
fn default_circuit_threshold() -> u32 { 5 }
fn default_circuit_cooldown_ms() -> u64 { 30_000 }
fn default_sync_interval_ms() -> u64 { 1000 }
fn default_max_retry_attempts() -> u32 { 8 }
fn default_remote_timeout_ms() -> u64 { 5000 }
fn default_health_interval_ms() -> u64 { 10_000 }
fn default_retry_base_delay_ms() -> u64 { 500 }
fn default_retry_max_delay_ms() -> u64 { 60_000 }
fn default_sync_batch_size() -> usize { 64 }
fn default_latency_window() -> usize { 256 }
fn default_legacy_separator() -> String { "_".to_string() }
fn default_event_capacity() -> usize { 256 }

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            cache_max_entries: default_cache_max_entries(),
            cache_ttl_ms: default_cache_ttl_ms(),
            debounce_ms: default_debounce_ms(),
            circuit_threshold: default_circuit_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            remote_timeout_ms: default_remote_timeout_ms(),
            health_interval_ms: default_health_interval_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            sync_batch_size: default_sync_batch_size(),
            latency_window: default_latency_window(),
            legacy_separator: default_legacy_separator(),
            legacy_namespaces: Vec::new(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

impl HandlerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("cache_max_entries", self.cache_max_entries as u64)?;
        positive("circuit_threshold", u64::from(self.circuit_threshold))?;
        positive("sync_interval_ms", self.sync_interval_ms)?;
        positive("max_retry_attempts", u64::from(self.max_retry_attempts))?;
        positive("remote_timeout_ms", self.remote_timeout_ms)?;
        positive("health_interval_ms", self.health_interval_ms)?;
        positive("retry_base_delay_ms", self.retry_base_delay_ms)?;
        positive("sync_batch_size", self.sync_batch_size as u64)?;
        positive("latency_window", self.latency_window as u64)?;
        positive("event_capacity", self.event_capacity as u64)?;

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry_max_delay_ms",
                reason: format!("must be at least retry_base_delay_ms ({})", self.retry_base_delay_ms),
            });
        }
        if self.legacy_separator.is_empty()
            || self.legacy_separator.contains('.')
            || self.legacy_separator.contains(':')
        {
            return Err(ConfigError::Invalid {
                field: "legacy_separator",
                reason: "must be non-empty and contain neither '.' nor ':'".into(),
            });
        }
        for namespace in &self.legacy_namespaces {
            validate_namespace(namespace).map_err(|e| ConfigError::Invalid {
                field: "legacy_namespaces",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// `None` when expiry is disabled.
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_ms > 0).then(|| Duration::from_millis(self.cache_ttl_ms))
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_threshold,
            cooldown: Duration::from_millis(self.circuit_cooldown_ms),
        }
    }

    #[must_use]
    pub fn sync_queue_config(&self) -> SyncQueueConfig {
        SyncQueueConfig {
            max_attempts: self.max_retry_attempts,
            backoff: Backoff::new(
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HandlerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cache_ttl(), Some(Duration::from_secs(300)));
        assert_eq!(config.circuit_config(), CircuitConfig::default());
        assert_eq!(config.sync_queue_config().max_attempts, 8);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = HandlerConfig::from_toml_str("").unwrap();
        assert_eq!(config, HandlerConfig::default());
    }

    #[test]
    fn test_camel_case_aliases() {
        let config = HandlerConfig::from_toml_str(
            r#"
            cacheMaxEntries = 10
            cacheTtlMs = 0
            debounceMs = 100
            circuitThreshold = 3
            circuitCooldownMs = 200
            syncIntervalMs = 50
            maxRetryAttempts = 2
            remoteTimeoutMs = 75
            "#,
        )
        .unwrap();

        assert_eq!(config.cache_max_entries, 10);
        assert_eq!(config.cache_ttl(), None);
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert_eq!(config.circuit_config().failure_threshold, 3);
        assert_eq!(config.circuit_config().cooldown, Duration::from_millis(200));
        assert_eq!(config.sync_interval(), Duration::from_millis(50));
        assert_eq!(config.max_retry_attempts, 2);
        assert_eq!(config.remote_timeout(), Duration::from_millis(75));
    }

    #[test]
    fn test_validation_rejects_zero_threshold() {
        let config = HandlerConfig { circuit_threshold: 0, ..Default::default() };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "circuit_threshold", .. }));
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let config = HandlerConfig {
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_separator() {
        let config = HandlerConfig { legacy_separator: ".".into(), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_legacy_namespaces_validated() {
        let config = HandlerConfig::from_toml_str(r#"legacyNamespaces = ["user", "user_settings"]"#).unwrap();
        assert_eq!(config.legacy_namespaces, vec!["user", "user_settings"]);

        let err = HandlerConfig::from_toml_str(r#"legacy_namespaces = ["queue"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "legacy_namespaces", .. }));
    }

    #[test]
    fn test_parse_error_surfaces() {
        let err = HandlerConfig::from_toml_str("cache_max_entries = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
