use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use strata_types::error::{Result, StrataError};

/// Environment variable carrying the repository password.
pub const ENV_PASSWORD: &str = "STRATA_PASSWORD";
/// Environment variable carrying the new password for a password change.
pub const ENV_NEW_PASSWORD: &str = "STRATA_NEW_PASSWORD";
/// Environment variable overriding the client config path.
pub const ENV_CONFIG_PATH: &str = "STRATA_CONFIG_PATH";
/// Environment variable overriding the cache directory.
pub const ENV_CACHE_DIRECTORY: &str = "STRATA_CACHE_DIRECTORY";
/// Environment variable overriding the log directory.
pub const ENV_LOG_DIR: &str = "STRATA_LOG_DIR";
/// Environment variable controlling credential persistence on connect.
pub const ENV_PERSIST_CREDENTIALS: &str = "STRATA_PERSIST_CREDENTIALS_ON_CONNECT";
/// Environment variable controlling the update check.
pub const ENV_CHECK_FOR_UPDATES: &str = "STRATA_CHECK_FOR_UPDATES";

fn default_true() -> bool {
    true
}

fn default_content_cache_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_metadata_cache_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_list_cache_seconds() -> u64 {
    30
}

/// Local cache sizing and placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingOptions {
    /// Root of the local cache; `None` keeps caches in memory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_content_cache_bytes")]
    pub max_content_cache_bytes: u64,
    #[serde(default = "default_metadata_cache_bytes")]
    pub max_metadata_cache_bytes: u64,
    #[serde(default = "default_list_cache_seconds")]
    pub max_list_cache_seconds: u64,
}

impl Default for CachingOptions {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_content_cache_bytes: default_content_cache_bytes(),
            max_metadata_cache_bytes: default_metadata_cache_bytes(),
            max_list_cache_seconds: default_list_cache_seconds(),
        }
    }
}

/// How the client reaches blob storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Driver kind, e.g. "filesystem" or "memory".
    pub kind: String,
    /// Driver-specific location (a directory path for "filesystem").
    #[serde(default)]
    pub path: String,
}

/// Client-side repository configuration, persisted as JSON.
///
/// Exactly one of `storage` and `api_server` is set: direct backend access
/// or a remote repository server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub hostname: String,
    pub username: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_true")]
    pub enable_actions: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub caching: CachingOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ConnectionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,
}

impl ClientConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            read_only: false,
            enable_actions: true,
            description: String::new(),
            caching: CachingOptions::default(),
            storage: None,
            api_server: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            StrataError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: ClientConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.storage.is_some() && self.api_server.is_some() {
            return Err(StrataError::Config(
                "config must not set both 'storage' and 'api_server'".into(),
            ));
        }
        if self.username.is_empty() || self.hostname.is_empty() {
            return Err(StrataError::Config(
                "config requires 'username' and 'hostname'".into(),
            ));
        }
        Ok(())
    }

    /// `username@hostname`, the identity recorded in leases and locks.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    /// Cache directory with the environment override applied.
    pub fn effective_cache_dir(&self) -> Option<PathBuf> {
        std::env::var_os(ENV_CACHE_DIRECTORY)
            .map(PathBuf::from)
            .or_else(|| self.caching.cache_dir.clone())
    }
}

/// Repository password from the environment, if set.
pub fn password_from_env() -> Option<String> {
    std::env::var(ENV_PASSWORD).ok().filter(|p| !p.is_empty())
}

/// New password for a password change, if set.
pub fn new_password_from_env() -> Option<String> {
    std::env::var(ENV_NEW_PASSWORD)
        .ok()
        .filter(|p| !p.is_empty())
}
