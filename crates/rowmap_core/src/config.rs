//! Store configuration.
//!
//! # Responsibility
//! - Describe connection, safety and logging settings in one value.
//! - Load settings from JSON text or `ROWMAP_*` environment variables.
//!
//! # Invariants
//! - Every field has a default, so partial JSON documents are accepted.
//! - Environment values that fail to parse are reported, never ignored.

use crate::db::DEFAULT_BUSY_TIMEOUT_MS;
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const ENV_DSN: &str = "ROWMAP_DSN";
pub const ENV_BUSY_TIMEOUT_MS: &str = "ROWMAP_BUSY_TIMEOUT_MS";
pub const ENV_ALLOW_GLOBAL_MUTATION: &str = "ROWMAP_ALLOW_GLOBAL_MUTATION";
pub const ENV_LOG_LEVEL: &str = "ROWMAP_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "ROWMAP_LOG_DIR";

const DEFAULT_DSN: &str = "sqlite::memory:";

/// Connection, safety and logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Storage connection string, see [`crate::db::SqliteStorage::connect`].
    pub dsn: String,
    pub busy_timeout_ms: u64,
    /// Lets unconditioned update/delete plans run without `allow_global()`.
    pub allow_global_mutation: bool,
    pub logging: LoggingConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: DEFAULT_DSN.to_string(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            allow_global_mutation: false,
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging settings consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of `trace|debug|info|warn|error`.
    pub level: String,
    /// Absolute directory for rolling log files; `None` disables file logging.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: crate::logging::default_log_level().to_string(),
            dir: None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Json(serde_json::Error),
    InvalidEnv { name: &'static str, value: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "invalid configuration document: {err}"),
            Self::InvalidEnv { name, value } => {
                write!(f, "invalid value `{value}` for environment variable {name}")
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::InvalidEnv { .. } => None,
        }
    }
}

impl StoreConfig {
    /// Parses a JSON document; missing keys take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(ConfigError::Json)
    }

    /// Builds a config from defaults overridden by `ROWMAP_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let read = |name: &'static str| {
            lookup(name)
                .map(|raw| raw.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(dsn) = read(ENV_DSN) {
            config.dsn = dsn;
        }
        if let Some(raw) = read(ENV_BUSY_TIMEOUT_MS) {
            config.busy_timeout_ms = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_BUSY_TIMEOUT_MS,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = read(ENV_ALLOW_GLOBAL_MUTATION) {
            config.allow_global_mutation = parse_flag(&raw).ok_or(ConfigError::InvalidEnv {
                name: ENV_ALLOW_GLOBAL_MUTATION,
                value: raw.clone(),
            })?;
        }
        if let Some(level) = read(ENV_LOG_LEVEL) {
            config.logging.level = level;
        }
        if let Some(dir) = read(ENV_LOG_DIR) {
            config.logging.dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
