use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::DEFAULT_HISTORY_LIMIT;
use crate::reaper::ReaperConfig;

/// Top-level config, loaded from TOML. Every section and field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub sessions: SessionConfig,
    pub reaper: ReaperSettings,
}

/// Listener and workspace layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address for the HTTP/WebSocket API. CLI `--bind` wins over this.
    pub bind: Option<SocketAddr>,
    /// Directory holding one working directory per project.
    pub workspace_root: Option<PathBuf>,
}

/// Per-session behaviour shared by every session in a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Output chunks retained for `status`.
    pub history_limit: usize,
    /// How long `execute` waits for a replaced process to exit after SIGTERM
    /// before sending SIGKILL.
    pub replace_grace_ms: u64,
    /// Extra environment for every spawned process.
    pub env: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            replace_grace_ms: 5_000,
            env: HashMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn replace_grace(&self) -> Duration {
        Duration::from_millis(self.replace_grace_ms)
    }
}

/// Idle reclamation schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub interval_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            idle_timeout_secs: 3600,
        }
    }
}

impl ReaperSettings {
    pub fn to_reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }
}

/// `$XDG_CONFIG_HOME/execd/config.toml` or the platform equivalent.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("execd")
        .join("config.toml")
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
