//! Indexer configuration loading from file and environment variables.

use std::time::Duration;

use serde::Deserialize;
use sorosave_db::DbRuntimeSettings;
use thiserror::Error;

use crate::scheduler::SchedulerConfig;

/// Top-level indexer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Polling settings.
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Poll scheduler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    /// Time between the starts of two consecutive polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of events requested per poll.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "sorosave_projection=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_batch_limit() -> usize {
    100
}

fn default_db_path() -> String {
    "sorosave.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_limit: default_batch_limit(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Scheduler settings derived from `[indexer]`.
    ///
    /// A zero interval or batch limit is raised to 1 so the loop can neither
    /// spin nor request empty pages.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.indexer.poll_interval_ms.max(1)),
            batch_limit: self.indexer.batch_limit.max(1),
        }
    }

    /// Pool settings derived from `[database]`.
    pub fn db_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.database.busy_timeout_ms,
            pool_max_size: self.database.pool_max_size.max(1),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SOROSAVE_DB_PATH` overrides `database.path`
/// - `SOROSAVE_POLL_INTERVAL_MS` overrides `indexer.poll_interval_ms`
/// - `SOROSAVE_BATCH_LIMIT` overrides `indexer.batch_limit`
/// - `SOROSAVE_LOG_LEVEL` overrides `logging.level`
/// - `SOROSAVE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `SOROSAVE_*` overrides read through `lookup`. Values that do not
/// parse are ignored.
fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(db_path) = lookup("SOROSAVE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(interval) = lookup("SOROSAVE_POLL_INTERVAL_MS") {
        if let Ok(parsed) = interval.parse() {
            config.indexer.poll_interval_ms = parsed;
        }
    }
    if let Some(limit) = lookup("SOROSAVE_BATCH_LIMIT") {
        if let Ok(parsed) = limit.parse() {
            config.indexer.batch_limit = parsed;
        }
    }
    if let Some(level) = lookup("SOROSAVE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("SOROSAVE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
