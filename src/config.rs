// Configuration File Support
//
// This module provides configuration file parsing for the dispatch throttle.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/dispatch-throttle/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::throttle::{
    InMemoryQueueStore, JsonlQueueStore, QueueStore, ThrottleConfig, ThrottleOverrides,
};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Defaults for every agent's throttle
    pub throttle: ThrottleConfig,

    /// Queue store configuration
    pub persistence: PersistenceConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Per-agent throttle overrides
    pub agents: HashMap<String, ThrottleOverrides>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Queue store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Store backend (memory, jsonl)
    pub backend: String,

    /// Log file path (jsonl backend)
    pub path: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Port for the admin/metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. If the config file does not exist, returns the
    /// default configuration with environment overrides applied.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            let config = Self::default().apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        // Apply environment variable overrides
        let config = config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/dispatch-throttle/config.toml` on Linux/Mac
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "dispatch-throttle", "dispatch-throttle")
        {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if XDG dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("dispatch-throttle")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - DISPATCH_THROTTLE_LOG_LEVEL
    /// - DISPATCH_THROTTLE_LOG_FORMAT
    /// - DISPATCH_THROTTLE_METRICS_PORT
    /// - the throttle defaults (see `ThrottleConfig::apply_env_overrides`)
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("DISPATCH_THROTTLE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("DISPATCH_THROTTLE_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(port) = std::env::var("DISPATCH_THROTTLE_METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }

        self.throttle = self.throttle.apply_env_overrides();
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.throttle
            .validate()
            .context("Invalid [throttle] defaults")?;

        // Validate persistence configuration
        match self.persistence.backend.to_lowercase().as_str() {
            "memory" => {}
            "jsonl" => {
                if self.persistence.path.is_none() {
                    anyhow::bail!("Persistence backend 'jsonl' requires a path");
                }
            }
            other => anyhow::bail!(
                "Invalid persistence backend: {}. Must be 'memory' or 'jsonl'",
                other
            ),
        }

        // Validate per-agent overrides
        for (agent_id, overrides) in &self.agents {
            overrides
                .merge_over(&self.throttle)
                .validate()
                .with_context(|| format!("Invalid overrides for agent '{}'", agent_id))?;
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Build the configured queue store
    pub fn queue_store(&self) -> Arc<dyn QueueStore> {
        match (self.persistence.backend.to_lowercase().as_str(), &self.persistence.path) {
            ("jsonl", Some(path)) => Arc::new(JsonlQueueStore::new(path)),
            _ => Arc::new(InMemoryQueueStore::new()),
        }
    }
}
