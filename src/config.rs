//! Config loading and env overrides.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;
// Loose objects accumulate quickly; packs consolidate on a slower cadence.
const DEFAULT_LOOSE_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_PACK_INTERVAL_SECS: u64 = 12 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Object store root to maintain. Overridable per-invocation on the
    /// CLI; `PM_OBJECTS_ROOT` wins over the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects_root: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub pack_interval_secs: u64,
    pub loose_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            objects_root: None,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            pack_interval_secs: DEFAULT_PACK_INTERVAL_SECS,
            loose_interval_secs: DEFAULT_LOOSE_INTERVAL_SECS,
        }
    }
}

impl MaintenanceConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn pack_interval(&self) -> Duration {
        Duration::from_secs(self.pack_interval_secs)
    }

    pub fn loose_interval(&self) -> Duration {
        Duration::from_secs(self.loose_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_max_age_days: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(14),
            retention_max_files: Some(32),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub fn config_path() -> PathBuf {
    paths::config_dir().join("config.toml")
}

/// Load the config file if present, fall back to defaults, then apply env
/// overrides on top.
pub fn load() -> Result<Config, ConfigError> {
    let path = config_path();
    let mut config = match fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Config::default(),
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

fn apply_overrides_from(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(root) = var("PM_OBJECTS_ROOT").filter(|s| !s.trim().is_empty()) {
        config.maintenance.objects_root = Some(PathBuf::from(root));
    }
    if let Some(secs) = var("PM_COMMAND_TIMEOUT_SECS").and_then(|s| s.trim().parse().ok()) {
        config.maintenance.command_timeout_secs = secs;
    }
    if let Some(dir) = var("PM_LOG_DIR").filter(|s| !s.trim().is_empty()) {
        config.logging.file.dir = Some(PathBuf::from(dir));
    }
}
