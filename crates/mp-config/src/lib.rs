//! MessagePusher Configuration System
//!
//! This crate provides TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub scheduler: SchedulerConfig,
    pub ledger: LedgerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            queue: QueueConfig::default(),
            dispatch: DispatchConfig::default(),
            scheduler: SchedulerConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "queue.max_workers must be at least 1".to_string(),
            ));
        }
        if self.dispatch.max_content_length == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.max_content_length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Embedded SQLite store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/messagepusher.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of worker tasks consuming the queue
    pub max_workers: usize,
    /// Timed pop timeout in milliseconds (stop flag re-check interval)
    pub worker_idle_timeout_ms: u64,
    /// Task-level retry budget
    pub max_retries: u32,
    /// Delay before a failed task is re-admitted, in seconds
    pub retry_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            worker_idle_timeout_ms: 1000,
            max_retries: 3,
            retry_delay_secs: 5,
        }
    }
}

/// Outbound dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Total request deadline for outbound calls and URL fetches, in seconds
    pub url_fetch_timeout_secs: u64,
    /// Cap on fetched URL content, in bytes
    pub max_content_length: usize,
    /// Per-attempt retry budget
    pub max_retries: i32,
    /// Age after which a `sending`/`processing` attempt is considered stuck
    pub stuck_threshold_secs: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            url_fetch_timeout_secs: 10,
            max_content_length: 1_048_576,
            max_retries: 3,
            stuck_threshold_secs: 600,
        }
    }
}

/// Periodic job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cleanup_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub stats_interval_secs: u64,
    /// Completed/cancelled tasks older than this are purged, in seconds
    pub max_task_age_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_interval_secs: 3600,
            retry_interval_secs: 300,
            stats_interval_secs: 86400,
            max_task_age_secs: 604800,
        }
    }
}

/// Error ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub max_error_history: usize,
    pub threshold_low: u64,
    pub threshold_medium: u64,
    pub threshold_high: u64,
    pub threshold_critical: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_error_history: 1000,
            threshold_low: 100,
            threshold_medium: 10,
            threshold_high: 1,
            threshold_critical: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.database.path, "data/messagepusher.db");
        assert_eq!(config.queue.max_workers, 5);
        assert_eq!(config.queue.retry_delay_secs, 5);
        assert_eq!(config.dispatch.url_fetch_timeout_secs, 10);
        assert_eq!(config.dispatch.max_content_length, 1_048_576);
        assert_eq!(config.scheduler.retry_interval_secs, 300);
        assert_eq!(config.ledger.max_error_history, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [http]
            port = 9999

            [queue]
            max_workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.http.port, 9999);
        assert_eq!(config.queue.max_workers, 2);
        // Untouched sections keep their defaults
        assert_eq!(config.dispatch.max_retries, 3);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config: AppConfig = toml::from_str(
            r#"
            [queue]
            max_workers = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
