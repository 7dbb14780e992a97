//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "messagepusher.toml",
    "./config/config.toml",
    "/etc/messagepusher/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        config.validate()?;
        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check MESSAGEPUSHER_CONFIG env var
        if let Ok(path) = env::var("MESSAGEPUSHER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_HTTP_HOST") {
            config.http.host = val;
        }

        // Database
        if let Ok(val) = env::var("MESSAGEPUSHER_DB_PATH") {
            config.database.path = val;
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_DB_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.database.max_connections = n;
            }
        }

        // Queue
        if let Ok(val) = env::var("MESSAGEPUSHER_QUEUE_MAX_WORKERS") {
            if let Ok(n) = val.parse() {
                config.queue.max_workers = n;
            }
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_QUEUE_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                config.queue.max_retries = n;
            }
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_QUEUE_RETRY_DELAY") {
            if let Ok(n) = val.parse() {
                config.queue.retry_delay_secs = n;
            }
        }

        // Dispatch
        if let Ok(val) = env::var("MESSAGEPUSHER_URL_FETCH_TIMEOUT") {
            if let Ok(n) = val.parse() {
                config.dispatch.url_fetch_timeout_secs = n;
            }
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_MAX_CONTENT_LENGTH") {
            if let Ok(n) = val.parse() {
                config.dispatch.max_content_length = n;
            }
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                config.dispatch.max_retries = n;
            }
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_STUCK_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.dispatch.stuck_threshold_secs = n;
            }
        }

        // Scheduler
        if let Ok(val) = env::var("MESSAGEPUSHER_SCHEDULER_ENABLED") {
            config.scheduler.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_CLEANUP_INTERVAL") {
            if let Ok(n) = val.parse() {
                config.scheduler.cleanup_interval_secs = n;
            }
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_RETRY_INTERVAL") {
            if let Ok(n) = val.parse() {
                config.scheduler.retry_interval_secs = n;
            }
        }
        if let Ok(val) = env::var("MESSAGEPUSHER_STATS_INTERVAL") {
            if let Ok(n) = val.parse() {
                config.scheduler.stats_interval_secs = n;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
