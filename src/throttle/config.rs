//! Throttle Configuration
//!
//! Per-agent pacing, retry and queue settings. A configuration is merged over
//! the defaults and validated once when a throttle is built, and is never
//! mutated afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{Result, ThrottleError};

/// Default throttle settings
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 20_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1_000;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 60_000;

/// Whole milliseconds of a duration, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Effective configuration of one agent's throttle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum time between two consecutive send attempts
    pub min_interval_ms: u64,

    /// Total attempts per logical message (first attempt included)
    pub max_retries: u32,

    /// Fixed delay between attempts
    pub retry_delay_ms: u64,

    /// Maximum number of pending queue items
    pub max_queue_size: usize,

    /// Per-attempt timeout
    pub send_timeout_ms: u64,

    /// Record per-agent metrics and export them to Prometheus
    pub enable_metrics: bool,

    /// Write queue records to the configured store
    pub enable_persistence: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            enable_metrics: true,
            enable_persistence: false,
        }
    }
}

impl ThrottleConfig {
    /// Create a configuration with the documented defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum interval between attempts
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval_ms = millis(interval);
        self
    }

    /// Set the total number of attempts
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = millis(delay);
        self
    }

    /// Set the queue capacity
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the per-attempt timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = millis(timeout);
        self
    }

    /// Enable or disable persistence
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.enable_persistence = enabled;
        self
    }

    /// Enable or disable metrics
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(ThrottleError::InvalidConfig(
                "max_retries must be >= 1".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(ThrottleError::InvalidConfig(
                "max_queue_size must be >= 1".to_string(),
            ));
        }
        if self.send_timeout_ms == 0 {
            return Err(ThrottleError::InvalidConfig(
                "send_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Load default overrides from environment variables
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(ms) = parsed("DISPATCH_THROTTLE_MIN_INTERVAL_MS") {
            self.min_interval_ms = ms;
        }
        if let Some(n) = parsed::<u32>("DISPATCH_THROTTLE_MAX_RETRIES") {
            if n > 0 {
                self.max_retries = n;
            }
        }
        if let Some(ms) = parsed("DISPATCH_THROTTLE_RETRY_DELAY_MS") {
            self.retry_delay_ms = ms;
        }
        if let Some(size) = parsed::<usize>("DISPATCH_THROTTLE_MAX_QUEUE_SIZE") {
            if size > 0 {
                self.max_queue_size = size;
            }
        }
        if let Some(ms) = parsed::<u64>("DISPATCH_THROTTLE_SEND_TIMEOUT_MS") {
            if ms > 0 {
                self.send_timeout_ms = ms;
            }
        }
        if let Some(enabled) = parsed("DISPATCH_THROTTLE_METRICS_ENABLED") {
            self.enable_metrics = enabled;
        }
        if let Some(enabled) = parsed("DISPATCH_THROTTLE_PERSISTENCE_ENABLED") {
            self.enable_persistence = enabled;
        }

        self
    }
}

/// Partial configuration supplied by a caller or a per-agent config table
///
/// Unset fields fall back to the registry defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleOverrides {
    pub min_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub max_queue_size: Option<usize>,
    pub send_timeout_ms: Option<u64>,
    pub enable_metrics: Option<bool>,
    pub enable_persistence: Option<bool>,
}

impl ThrottleOverrides {
    /// Merge these overrides over `base`
    pub fn merge_over(&self, base: &ThrottleConfig) -> ThrottleConfig {
        ThrottleConfig {
            min_interval_ms: self.min_interval_ms.unwrap_or(base.min_interval_ms),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(base.retry_delay_ms),
            max_queue_size: self.max_queue_size.unwrap_or(base.max_queue_size),
            send_timeout_ms: self.send_timeout_ms.unwrap_or(base.send_timeout_ms),
            enable_metrics: self.enable_metrics.unwrap_or(base.enable_metrics),
            enable_persistence: self.enable_persistence.unwrap_or(base.enable_persistence),
        }
    }

    /// Overrides that only change the minimum interval
    pub fn min_interval(interval: Duration) -> Self {
        Self {
            min_interval_ms: Some(millis(interval)),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ThrottleConfig::default();
        assert_eq!(config.min_interval(), Duration::from_secs(20));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.send_timeout(), Duration::from_secs(60));
        assert!(config.enable_metrics);
        assert!(!config.enable_persistence);
    }

    #[test]
    fn test_builder_methods() {
        let config = ThrottleConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_retries(5)
            .with_retry_delay(Duration::from_millis(10))
            .with_max_queue_size(2)
            .with_send_timeout(Duration::from_millis(250))
            .with_persistence(true);

        assert_eq!(config.min_interval_ms, 100);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay_ms, 10);
        assert_eq!(config.max_queue_size, 2);
        assert_eq!(config.send_timeout_ms, 250);
        assert!(config.enable_persistence);
    }

    #[test]
    fn test_builders_saturate_huge_durations() {
        let config = ThrottleConfig::new()
            .with_min_interval(Duration::MAX)
            .with_retry_delay(Duration::MAX)
            .with_send_timeout(Duration::MAX);

        assert_eq!(config.min_interval_ms, u64::MAX);
        assert_eq!(config.retry_delay_ms, u64::MAX);
        assert_eq!(config.send_timeout_ms, u64::MAX);
        assert_eq!(
            ThrottleOverrides::min_interval(Duration::MAX).min_interval_ms,
            Some(u64::MAX)
        );
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_validation() {
        assert!(ThrottleConfig::default().validate().is_ok());
        assert!(ThrottleConfig::default().with_max_retries(0).validate().is_err());
        assert!(ThrottleConfig::default().with_max_queue_size(0).validate().is_err());
        assert!(ThrottleConfig::default()
            .with_send_timeout(Duration::ZERO)
            .validate()
            .is_err());
        // A zero interval simply disables pacing
        assert!(ThrottleConfig::default()
            .with_min_interval(Duration::ZERO)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_overrides_merge() {
        let base = ThrottleConfig::default();
        let overrides = ThrottleOverrides {
            min_interval_ms: Some(500),
            max_queue_size: Some(7),
            ..ThrottleOverrides::default()
        };

        let merged = overrides.merge_over(&base);
        assert_eq!(merged.min_interval_ms, 500);
        assert_eq!(merged.max_queue_size, 7);
        assert_eq!(merged.max_retries, base.max_retries);
        assert_eq!(merged.send_timeout_ms, base.send_timeout_ms);
    }

    #[test]
    fn test_empty_overrides_keep_base() {
        let base = ThrottleConfig::default().with_max_retries(9);
        assert_eq!(ThrottleOverrides::default().merge_over(&base), base);
    }

    #[test]
    fn test_config_serialization() {
        let config = ThrottleConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ThrottleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);

        let partial: ThrottleConfig = serde_json::from_str(r#"{"max_retries": 2}"#).unwrap();
        assert_eq!(partial.max_retries, 2);
        assert_eq!(partial.min_interval_ms, DEFAULT_MIN_INTERVAL_MS);
    }
}
