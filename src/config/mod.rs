//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calling::{ice, negotiation, CallSettings, Identity};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity this client calls and answers as
    pub identity: Option<String>,
    /// Name shown to peers when the store has none
    pub display_name: Option<String>,
    /// Base URL of the call session store
    pub store_url: String,
    /// Bearer token for the store (kept out of logs)
    pub auth_token: Option<String>,
    pub signaling: SignalingConfig,
    pub negotiation: NegotiationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub poll_interval_ms: u64,
    pub incoming_poll_interval_ms: u64,
    /// Consecutive failed fetches before the user is told
    pub fetch_retry_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub gathering_timeout_ms: u64,
    pub stun_servers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: None,
            display_name: None,
            store_url: "http://localhost:8080".to_string(),
            auth_token: None,
            signaling: SignalingConfig::default(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            incoming_poll_interval_ms: 2000,
            fetch_retry_limit: 3,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            gathering_timeout_ms: negotiation::DEFAULT_GATHERING_TIMEOUT.as_millis() as u64,
            stun_servers: vec![ice::DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "pollcall", "pollcall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains the store token)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Configured identity, or an error telling the user to run `init`
    pub fn identity(&self) -> Result<Identity> {
        self.identity
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(Identity::from)
            .context("No identity configured. Run `pollcall init <identity>` first.")
    }

    /// Call engine tunables
    pub fn settings(&self) -> CallSettings {
        CallSettings {
            poll_interval: Duration::from_millis(self.signaling.poll_interval_ms.max(1)),
            incoming_poll_interval: Duration::from_millis(
                self.signaling.incoming_poll_interval_ms.max(1),
            ),
            fetch_retry_limit: self.signaling.fetch_retry_limit.max(1),
            gathering_timeout: Duration::from_millis(self.negotiation.gathering_timeout_ms),
            stun_servers: self.negotiation.stun_servers.clone(),
        }
    }
}
