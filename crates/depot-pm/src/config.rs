//! User configuration (~/.depot/config.toml)
//!
//! ```toml
//! repositories = ["https://repository.depot.dev", "http://localhost:5984/private"]
//! cache_dir = "/var/cache/depot"
//! target_dir = "packages"
//! concurrency = 20
//! timeout_secs = 30
//! ```
//!
//! Every key is optional; a missing file yields the defaults.

use crate::repository::DEFAULT_REPOSITORY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file name inside `~/.depot/`
pub const CONFIG_FILE: &str = "config.toml";

/// Default install directory, relative to the project
pub const DEFAULT_TARGET_DIR: &str = "packages";

/// Default number of concurrent fetch tasks
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Errors that can occur while loading the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read {}: {source}", path.display())]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse {}: {source}", path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Invalid value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Settings shared by every command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Repository endpoints, highest priority first
    pub repositories: Vec<String>,

    /// Cache root; `~/.depot/cache` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Install directory
    pub target_dir: PathBuf,

    /// Maximum number of concurrent fetch tasks
    pub concurrency: usize,

    /// Timeout for each repository request, in seconds
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repositories: vec![DEFAULT_REPOSITORY.to_string()],
            cache_dir: None,
            target_dir: PathBuf::from(DEFAULT_TARGET_DIR),
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load `~/.depot/config.toml`, falling back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Default config location
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".depot").join(CONFIG_FILE))
    }

    /// Load a config file; a missing file yields the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::IoError {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repositories.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one repository is required".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
