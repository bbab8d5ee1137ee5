//! Client config load/save for `~/.mind-search/config.yaml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::DEFAULT_RECONNECT_DELAY;

/// Endpoint used when neither the config file nor the environment names one.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8000/ws";

/// Environment variable overriding `server.url`.
pub const SERVER_URL_ENV: &str = "MIND_SEARCH_URL";

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "MIND_SEARCH_CONFIG";

/// Server section (url, reconnect_delay_ms).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_delay_ms: Option<u64>,
}

/// UI section (preferences_path).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UiSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferences_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub ui: UiSection,
}

/// Settings the chat client runs with, after defaults and overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub reconnect_delay: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ClientSettings {
    /// Settings from `config`, with `MIND_SEARCH_URL` taking precedence over `server.url`.
    pub fn from_config(config: &Config) -> Self {
        Self::resolve(config, std::env::var(SERVER_URL_ENV).ok())
    }

    pub fn resolve(config: &Config, url_override: Option<String>) -> Self {
        let server_url = url_override
            .filter(|u| !u.trim().is_empty())
            .or_else(|| config.server.url.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.into());
        let reconnect_delay = config
            .server
            .reconnect_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RECONNECT_DELAY);
        Self {
            server_url,
            reconnect_delay,
        }
    }
}

/// Returns the default config file path: `~/.mind-search/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    Some(app_dir()?.join("config.yaml"))
}

/// Returns the default preferences file path: `~/.mind-search/preferences.yaml`.
pub fn default_preferences_path() -> Option<PathBuf> {
    Some(app_dir()?.join("preferences.yaml"))
}

fn app_dir() -> Option<PathBuf> {
    Some(home_dir()?.join(".mind-search"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

/// Load config from a YAML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Like [`load`], but a missing file yields the default config.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    load(path)
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Config load/save error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
