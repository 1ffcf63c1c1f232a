//! Configuration management for Syndicate

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Per-platform retry policy overrides, keyed by platform id
    #[serde(default)]
    pub platforms: HashMap<String, PlatformRetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Width of the worker pool draining the queue
    pub workers: usize,
    /// Deadline for a single platform adapter call, in seconds
    pub adapter_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            adapter_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds a leased job may run before it is considered stalled
    pub lease_timeout_secs: u64,
    /// Seconds between due-scan ticks
    pub scan_interval_secs: u64,
    /// Completed/failed entries older than this are purged, in seconds
    pub retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 120,
            scan_interval_secs: 60,
            retention_secs: 7 * 24 * 3600,
        }
    }
}

/// Retry tuning for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformRetryConfig {
    /// Maximum retry attempts before the platform is flagged for review
    pub max_retries: i64,
    /// Base delay for exponential backoff, in seconds
    pub base_delay_secs: u64,
    /// Backoff ceiling, in seconds
    pub max_delay_secs: u64,
    /// Cooldown applied on rate limits with no retry-after hint, in seconds
    pub rate_limit_cooldown_secs: u64,
}

impl Default for PlatformRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 60,
            max_delay_secs: 3600,
            rate_limit_cooldown_secs: 15 * 60,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        let mut platforms = HashMap::new();
        platforms.insert(
            "twitter".to_string(),
            PlatformRetryConfig {
                max_retries: 3,
                base_delay_secs: 60,
                max_delay_secs: 1800,
                rate_limit_cooldown_secs: 15 * 60,
            },
        );
        platforms.insert(
            "linkedin".to_string(),
            PlatformRetryConfig {
                max_retries: 4,
                base_delay_secs: 120,
                max_delay_secs: 3600,
                rate_limit_cooldown_secs: 20 * 60,
            },
        );
        platforms.insert(
            "mastodon".to_string(),
            PlatformRetryConfig {
                max_retries: 5,
                base_delay_secs: 30,
                max_delay_secs: 1800,
                rate_limit_cooldown_secs: 10 * 60,
            },
        );

        Self {
            database: DatabaseConfig {
                path: "~/.local/share/syndicate/syndicate.db".to_string(),
            },
            dispatch: DispatchConfig::default(),
            queue: QueueConfig::default(),
            platforms,
        }
    }

    /// Retry policy for a platform, falling back to defaults when the
    /// platform has no explicit section.
    pub fn retry_config(&self, platform: &str) -> PlatformRetryConfig {
        self.platforms
            .get(platform)
            .cloned()
            .unwrap_or_default()
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICATE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicate").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("syndicate"))
}
