//! Configuration loading and path resolution
//!
//! Config file and warehouse path follow the same priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing config file is not an error: defaults are used instead.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "USERMETRICS_CONFIG";

/// Environment variable naming the warehouse database
pub const DATABASE_ENV_VAR: &str = "USERMETRICS_DB";

/// Default canonical route root for cached requests
pub const DEFAULT_ROUTE_ROOT: &str = "/metrics";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Warehouse SQLite file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Batch executor settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Concurrent workers per batch; 0 or 1 runs sequentially
    #[serde(default)]
    pub worker_count: usize,
}

/// Signature cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_route_root")]
    pub route_root: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            route_root: default_route_root(),
        }
    }
}

fn default_route_root() -> String {
    DEFAULT_ROUTE_ROOT.to_string()
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter directive (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Write a TOML config file, creating parent directories
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Platform config file location (`<config dir>/usermetrics/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("usermetrics").join("config.toml"))
}

/// OS-dependent default warehouse location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("usermetrics").join("warehouse.db"))
        .unwrap_or_else(|| PathBuf::from("./usermetrics_data/warehouse.db"))
}

/// Resolves which config file to load
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    cli_path: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new(cli_path: Option<PathBuf>) -> Self {
        Self { cli_path }
    }

    /// Config file to read, if any: CLI argument, then environment variable,
    /// then the platform default when that file exists.
    pub fn config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            return Some(path.clone());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        default_config_path().filter(|p| p.exists())
    }

    /// Load the resolved config.
    ///
    /// Returns defaults when no config file is configured. An explicitly
    /// named file that is missing or malformed is an error, which callers
    /// may downgrade to a warning.
    pub fn load(&self) -> Result<TomlConfig> {
        match self.config_path() {
            Some(path) => {
                debug!("Loading config from {}", path.display());
                load_toml_config(&path)
            }
            None => Ok(TomlConfig::default()),
        }
    }
}

/// Warehouse path: CLI argument, environment variable, config file, default
pub fn resolve_database_path(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(path) = &config.database_path {
        return path.clone();
    }
    default_database_path()
}
