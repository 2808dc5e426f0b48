//! Engine configuration.
//!
//! Everything operational is external: worker count, session timeout, sweep
//! interval, intake rate ceiling, sink retry budget, the abandonment-reason
//! weight table. Loaded from TOML with full defaults, so an empty document
//! is a valid configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;

/// Default abandonment-reason weight table.
///
/// Percentages from observed production distributions; any table whose
/// weights are positive works, they are normalized at sample time.
fn default_abandonment_weights() -> BTreeMap<String, u32> {
    [
        ("high_price", 18),
        ("unexpected_shipping_cost", 16),
        ("comparison_shopping", 15),
        ("found_better_deal", 14),
        ("just_browsing", 12),
        ("payment_concerns", 10),
        ("slow_checkout", 8),
        ("needed_more_time", 7),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Sink retry/backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts before dead-lettering (default: 5).
    pub max_attempts: u32,
    /// Initial delay before first retry, in milliseconds (default: 50).
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds (default: 2000).
    pub max_delay_ms: u64,
    /// Multiplier applied to delay after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (default: 0.1 = ±10%).
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            backoff_factor: 2.0,
            jitter_percent: 0.1,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of parallel workers, one per stream partition (default: 5).
    pub workers: usize,

    /// Session inactivity timeout in seconds (default: 60).
    pub session_timeout_secs: u64,

    /// Sweep interval in seconds for the per-worker timeout scan (default: 5).
    pub sweep_interval_secs: u64,

    /// Grace window in seconds after checkout_initiated during which the
    /// inactivity timeout is extended (default: 30). Payment redirects are
    /// slow; a session mid-checkout should not be swept at the base timeout.
    pub checkout_grace_secs: u64,

    /// Intake ceiling in events per second. 0 disables rate limiting
    /// (default: 0).
    pub max_events_per_sec: u32,

    /// Bound on each worker's intake queue (default: 256).
    pub worker_queue_depth: usize,

    /// Maximum events pulled from the broker per poll (default: 64).
    pub poll_batch_size: usize,

    /// Per-session dedupe window: how many recent event ids are remembered
    /// for duplicate detection (default: 32).
    pub dedupe_window: usize,

    /// Per-worker bound on remembered finalized session ids, used to drop
    /// late events instead of reopening sessions (default: 1024).
    pub finalized_window: usize,

    /// Broker reconnect attempts before the engine reports unhealthy and
    /// halts (default: 10).
    pub broker_retry_budget: u32,

    /// Capacity of the dead-letter queue for summaries that exhausted the
    /// sink retry budget (default: 512, drop-oldest).
    pub dead_letter_capacity: usize,

    /// Cache entry TTL grace in seconds, added to the session timeout
    /// (default: 300).
    pub cache_grace_secs: u64,

    /// Abandonment-reason weight table. Keys are reason labels, values are
    /// relative weights.
    pub abandonment_weights: BTreeMap<String, u32>,

    /// Sink retry/backoff parameters.
    pub retry: RetryConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            session_timeout_secs: 60,
            sweep_interval_secs: 5,
            checkout_grace_secs: 30,
            max_events_per_sec: 0,
            worker_queue_depth: 256,
            poll_batch_size: 64,
            dedupe_window: 32,
            finalized_window: 1024,
            broker_retry_budget: 10,
            dead_letter_capacity: 512,
            cache_grace_secs: 300,
            abandonment_weights: default_abandonment_weights(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a TOML string and validate it.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Validate field ranges. Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.session_timeout_secs == 0 {
            return Err(invalid("session_timeout_secs", "must be at least 1"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(invalid("sweep_interval_secs", "must be at least 1"));
        }
        if self.worker_queue_depth == 0 {
            return Err(invalid("worker_queue_depth", "must be at least 1"));
        }
        if self.poll_batch_size == 0 {
            return Err(invalid("poll_batch_size", "must be at least 1"));
        }
        if self.abandonment_weights.is_empty() {
            return Err(invalid("abandonment_weights", "table must not be empty"));
        }
        if self.abandonment_weights.values().all(|w| *w == 0) {
            return Err(invalid(
                "abandonment_weights",
                "at least one weight must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor", "must be >= 1.0"));
        }
        Ok(())
    }

    /// Session inactivity timeout as a `Duration`.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Sweep interval as a `Duration`.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Cache TTL: session timeout plus the grace window.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs + self.cache_grace_secs)
    }
}

fn invalid(field: &'static str, reason: &str) -> crate::Error {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workers, 5);
        assert_eq!(config.session_timeout_secs, 60);
        assert_eq!(config.abandonment_weights.len(), 8);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.workers, 5);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            workers = 3
            session_timeout_secs = 120

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.session_timeout_secs, 120);
        assert_eq!(config.retry.max_attempts, 2);
        // Untouched fields keep defaults.
        assert_eq!(config.sweep_interval_secs, 5);
    }

    #[test]
    fn zero_workers_rejected() {
        let err = EngineConfig::from_toml_str("workers = 0").unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn empty_weight_table_rejected() {
        let mut config = EngineConfig::default();
        config.abandonment_weights.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn all_zero_weights_rejected() {
        let mut config = EngineConfig::default();
        for w in config.abandonment_weights.values_mut() {
            *w = 0;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn custom_weight_table_accepted() {
        let config = EngineConfig::from_toml_str(
            r#"
            [abandonment_weights]
            price = 50
            other = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.abandonment_weights.len(), 2);
    }

    #[test]
    fn cache_ttl_includes_grace() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(360));
    }
}
