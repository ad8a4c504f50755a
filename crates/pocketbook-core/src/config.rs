//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/pocketbook/config.toml)
//! 3. Environment variables (POCKETBOOK_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "POCKETBOOK";

/// Longest accepted reload cooldown (one year)
const MAX_RELOAD_COOLDOWN_SECS: u64 = 365 * 24 * 60 * 60;

/// Which remote backend the configuration selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Hosted REST API with email-link login
    Hosted { url: String, api_key: String },
    /// Shared SQLite file
    SharedFile { path: PathBuf },
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local data (local store, login session, session store)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Hosted backend base URL
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Hosted backend public API key
    #[serde(default)]
    pub remote_api_key: Option<String>,

    /// Shared SQLite database used as the remote store
    #[serde(default)]
    pub remote_db: Option<PathBuf>,

    /// Seconds between scheduled pulls
    #[serde(default = "default_pull_interval")]
    pub pull_interval_secs: u64,

    /// Seconds between scheduled pushes
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,

    /// Minimum seconds between two automatic reloads
    #[serde(default = "default_reload_cooldown")]
    pub reload_cooldown_secs: u64,

    /// Delay before a scheduled reload fires
    #[serde(default = "default_reload_delay")]
    pub reload_delay_ms: u64,

    /// Log file path (defaults to stderr when logging is enabled)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: None,
            remote_api_key: None,
            remote_db: None,
            pull_interval_secs: default_pull_interval(),
            push_interval_secs: default_push_interval(),
            reload_cooldown_secs: default_reload_cooldown(),
            reload_delay_ms: default_reload_delay(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (POCKETBOOK_DATA_DIR, POCKETBOOK_REMOTE_URL, ...)
    /// 2. Config file (~/.config/pocketbook/config.toml or POCKETBOOK_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, honoring a `--config` path from the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_REMOTE_URL", ENV_PREFIX)) {
            self.remote_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_REMOTE_API_KEY", ENV_PREFIX)) {
            self.remote_api_key = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_REMOTE_DB", ENV_PREFIX)) {
            self.remote_db = non_empty(val).map(PathBuf::from);
        }

        if let Ok(val) = std::env::var(format!("{}_PULL_INTERVAL_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.pull_interval_secs = secs;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_PUSH_INTERVAL_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.push_interval_secs = secs;
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with POCKETBOOK_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pocketbook")
            .join("config.toml")
    }

    /// The remote backend, if one is fully configured
    ///
    /// A hosted URL without an API key is not usable; a shared file wins
    /// when both are set.
    pub fn backend(&self) -> Option<Backend> {
        if let Some(ref path) = self.remote_db {
            return Some(Backend::SharedFile { path: path.clone() });
        }

        match (&self.remote_url, &self.remote_api_key) {
            (Some(url), Some(api_key)) => Some(Backend::Hosted {
                url: url.clone(),
                api_key: api_key.clone(),
            }),
            _ => None,
        }
    }

    /// Whether cloud sync can run at all
    pub fn is_sync_configured(&self) -> bool {
        self.backend().is_some()
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs.max(1))
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs.max(1))
    }

    /// Reload cooldown, capped at one year
    pub fn reload_cooldown(&self) -> chrono::Duration {
        let secs = self.reload_cooldown_secs.min(MAX_RELOAD_COOLDOWN_SECS);
        chrono::Duration::try_seconds(secs as i64)
            .unwrap_or_else(|| chrono::Duration::seconds(default_reload_cooldown() as i64))
    }

    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }

    /// Get the path to the local key-value store
    pub fn local_store_path(&self) -> PathBuf {
        self.data_dir.join("local_store.json")
    }

    /// Get the path to the persisted login session
    pub fn auth_session_path(&self) -> PathBuf {
        self.data_dir.join("auth.json")
    }

    /// Get the session-scoped storage directory
    pub fn session_dir(&self) -> PathBuf {
        self.data_dir.join("session")
    }

    /// Get the marker file present while a field is being edited
    pub fn edit_marker_path(&self) -> PathBuf {
        self.data_dir.join("editing")
    }
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pocketbook")
}

fn default_pull_interval() -> u64 {
    60
}

fn default_push_interval() -> u64 {
    20
}

fn default_reload_cooldown() -> u64 {
    30 * 60
}

fn default_reload_delay() -> u64 {
    1500
}
