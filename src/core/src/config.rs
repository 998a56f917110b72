use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ForgeError, Result};

/// Default layer cache size limit: 20 GB.
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 20 * 1024 * 1024 * 1024;

/// Name of the ignore file looked up at the root of a build context.
pub const IGNORE_FILE_NAME: &str = ".forgeignore";

/// Forge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Layer cache configuration
    pub cache: CacheConfig,

    /// Maximum number of independent stages built concurrently
    pub max_parallel_stages: usize,

    /// Log level
    pub log_level: LogLevel,

    /// Emit logs as JSON lines
    pub log_json: bool,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            max_parallel_stages: default_parallelism(),
            log_level: LogLevel::Info,
            log_json: false,
        }
    }
}

impl ForgeConfig {
    /// Load configuration from a YAML or JSON file, chosen by extension.
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ForgeError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: ForgeConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            other => {
                return Err(ForgeError::ConfigError(format!(
                    "Unsupported config format {:?} for {} (expected .yaml, .yml or .json)",
                    other.unwrap_or(""),
                    path.display()
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_stages == 0 {
            return Err(ForgeError::ConfigError(
                "max_parallel_stages must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Layer cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (blobs, layer records, GC roots)
    pub dir: PathBuf,

    /// Size limit used by `prune_to_size`
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_bytes: DEFAULT_CACHE_MAX_BYTES,
        }
    }
}

/// `~/.a3s/forge/cache`, or a relative `.a3s/forge/cache` when no home
/// directory is known.
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".a3s")
        .join("forge")
        .join("cache")
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}
