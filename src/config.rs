//! Configuration file parser for ~/.config/job-importer/config.toml.
//!
//! The config file is optional; a missing or empty file yields
//! `Config::default()`. Unknown keys are accepted but logged as warnings.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{DEFAULT_FETCH_TIMEOUT, DEFAULT_USER_AGENT};
use crate::queue::{RetryPolicy, WorkerConfig};
use crate::util::{validate_feed_url, UrlValidationError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid feed URL '{url}': {source}")]
    InvalidFeed {
        url: String,
        #[source]
        source: UrlValidationError,
    },
}

/// Feeds imported when the config file names none.
pub const DEFAULT_FEEDS: &[&str] = &[
    "https://jobicy.com/?feed=job_feed",
    "https://jobicy.com/?feed=job_feed&job_categories=smm&job_types=full-time",
    "https://jobicy.com/?feed=job_feed&job_categories=seller&job_types=full-time&search_region=france",
    "https://jobicy.com/?feed=job_feed&job_categories=design-multimedia",
    "https://jobicy.com/?feed=job_feed&job_categories=data-science",
    "https://jobicy.com/?feed=job_feed&job_categories=copywriting",
    "https://jobicy.com/?feed=job_feed&job_categories=business",
    "https://jobicy.com/?feed=job_feed&job_categories=management",
    "https://www.higheredjobs.com/rss/articleFeed.cfm",
];

const KNOWN_KEYS: &[&str] = &[
    "database_path",
    "feeds",
    "sync_interval_minutes",
    "worker_concurrency",
    "max_attempts",
    "backoff_base_ms",
    "poll_interval_ms",
    "fetch_timeout_secs",
    "user_agent",
];

// ============================================================================
// Configuration
// ============================================================================

/// Top-level application configuration.
///
/// Every key is optional; missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file. `None` means `jobs.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Feed URLs imported by `sync` and `serve`.
    pub feeds: Vec<String>,

    /// Minutes between scheduled syncs in `serve` mode. 0 disables scheduling.
    pub sync_interval_minutes: u64,

    pub worker_concurrency: usize,

    /// Delivery attempts per task before it is dead-lettered.
    pub max_attempts: u32,

    /// First retry delay; doubles on each further attempt.
    pub backoff_base_ms: u64,

    /// Idle wait between claim attempts when the queue is empty.
    pub poll_interval_ms: u64,

    pub fetch_timeout_secs: u64,

    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            feeds: DEFAULT_FEEDS.iter().map(|s| s.to_string()).collect(),
            sync_interval_minutes: 60,
            worker_concurrency: 10,
            max_attempts: 3,
            backoff_base_ms: 1000,
            poll_interval_ms: 500,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT.as_secs(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Feed URL without http/https scheme or host → `Err(ConfigError::InvalidFeed)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for url in &self.feeds {
            validate_feed_url(url).map_err(|source| ConfigError::InvalidFeed {
                url: url.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Database location, defaulting to `jobs.db` inside `config_dir`.
    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("jobs.db"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_concurrency(self.worker_concurrency)
            .with_poll_interval(self.poll_interval())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    /// `None` when scheduled syncing is disabled.
    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_minutes > 0)
            .then(|| Duration::from_secs(self.sync_interval_minutes.saturating_mul(60)))
    }
}

// ============================================================================
// Tests
// ============================================================================
