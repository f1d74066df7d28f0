//! Root configuration: one TOML file with a section per subsystem.
//!
//! Resolution order: an explicit `--config` path, then `$LODESTONE_CONFIG`,
//! then `<config_dir>/lodestone/lodestone.toml`. An explicitly named file
//! must exist; a missing file at the well-known location just yields
//! defaults. Unknown keys are tolerated so a config written for a newer
//! build still loads on an older one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::DriverProxyConfig;
use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;
use crate::repair::RepairConfig;
use crate::vectorizer::VectorizationConfig;
use crate::watcher::WatcherConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "LODESTONE_CONFIG";

/// Health monitor settings, deserialized from the `[monitor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Whether `serve` runs the health monitor.
    pub enabled: bool,
    /// Sweep interval, in milliseconds.
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Root configuration for the supervisor and every worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub monitor: MonitorConfig,
    pub driver: DriverProxyConfig,
    pub watcher: WatcherConfig,
    pub vectorization: VectorizationConfig,
    pub repair: RepairConfig,
}

impl Config {
    /// Load configuration, resolving the file in order: `explicit`,
    /// `$LODESTONE_CONFIG`, the per-user default location.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            if !env_path.trim().is_empty() {
                return Self::load_from(Path::new(&env_path));
            }
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                debug!("No config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let contents = fs::read_to_string(path)
            .map_err(|err| ConfigError::ReadFailed(path.display().to_string(), err.to_string()))?;
        let config =
            toml::from_str(&contents).map_err(|err| ConfigError::ParseFailed(err.to_string()))?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }
}

/// The per-user config file location.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lodestone").join("lodestone.toml"))
}

/// Where `load` would look, without touching the filesystem.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
        if !env_path.trim().is_empty() {
            return Some(PathBuf::from(env_path));
        }
    }
    default_config_path()
}
