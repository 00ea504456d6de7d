use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregatorConfig, DEFAULT_MAX_COMMITS};
use crate::error::CawError;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_RETRY_INITIAL_MS: u64 = 2_000;
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;
pub const DEFAULT_SYNC_THRESHOLD_MS: u64 = 1_000;

/// Client configuration stored in `<config dir>/caw/config.toml`.
///
/// Every field is optional; accessors fall back to the defaults above.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CawConfig {
    /// Directory holding the local service sockets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_root: Option<PathBuf>,
    /// Request deadline in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// First reconnect delay in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_initial_ms: Option<u64>,
    /// Upper bound for the reconnect delay in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_max_ms: Option<u64>,
    /// Reconnect attempts before giving up (unset = forever)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Minimum spacing between refreshes of one file, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_threshold_ms: Option<u64>,
    /// Distinct commit IDs kept per file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_commits: Option<usize>,
}

impl CawConfig {
    pub fn socket_root(&self) -> PathBuf {
        self.socket_root.clone().unwrap_or_else(default_socket_root)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS))
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms.unwrap_or(DEFAULT_RETRY_INITIAL_MS))
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms.unwrap_or(DEFAULT_RETRY_MAX_MS))
    }

    pub fn sync_threshold(&self) -> Duration {
        Duration::from_millis(self.sync_threshold_ms.unwrap_or(DEFAULT_SYNC_THRESHOLD_MS))
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            max_commits: self.max_commits.unwrap_or(DEFAULT_MAX_COMMITS),
        }
    }
}

/// Directory the local service puts its sockets in
pub const DEFAULT_SOCKET_ROOT: &str = "/var/tmp";

/// Default socket directory, where the local service listens
pub fn default_socket_root() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_ROOT)
}

/// Default config file path: `$XDG_CONFIG_HOME/caw/config.toml`,
/// falling back to `$HOME/.config/caw/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    let base = match std::env::var("XDG_CONFIG_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(std::env::var("HOME").ok()?).join(".config"),
    };
    Some(base.join("caw").join("config.toml"))
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<CawConfig, CawError> {
    if !path.exists() {
        return Ok(CawConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    let config: CawConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save config to `path`, creating parent directories
pub fn save_config(path: &Path, config: &CawConfig) -> Result<(), CawError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
