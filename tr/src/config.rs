//! TaskRelay configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::{SessionCipher, SessionError};

/// Main TaskRelay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Answer accepted results with the next action instead of "nop"
    #[serde(rename = "auto-get-action")]
    pub auto_get_action: bool,

    /// Where nodes fetch the worker script from
    #[serde(rename = "worker-script-url")]
    pub worker_script_url: Option<String>,

    /// Secret the session-token key is derived from
    #[serde(rename = "secret-key")]
    pub secret_key: Option<String>,

    /// Append error source chains to error envelopes
    pub debug: bool,

    /// Nodes registry configuration
    pub registry: RegistryConfig,

    /// Background eviction configuration
    pub sweeper: SweeperConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_get_action: true,
            worker_script_url: None,
            secret_key: None,
            debug: false,
            registry: RegistryConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: taskrelay.yml
        let local_config = PathBuf::from("taskrelay.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/taskrelay/taskrelay.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskrelay").join("taskrelay.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Write the configuration as YAML
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(path, content).context(format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// The part of the configuration nodes get on registration
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            auto_get_action: self.auto_get_action,
            worker_script_url: self.worker_script_url.clone(),
        }
    }

    /// Cipher for session tokens, keyed by `secret-key`
    pub fn session_cipher(&self) -> std::result::Result<SessionCipher, SessionError> {
        SessionCipher::from_secret(self.secret_key.as_deref().unwrap_or_default())
    }

    /// Copy safe to print
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.secret_key.is_some() {
            config.secret_key = Some("<redacted>".to_string());
        }
        config
    }
}

/// Node-facing configuration, sent as-is on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub auto_get_action: bool,
    pub worker_script_url: Option<String>,
}

/// Nodes registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Nodes silent for longer than this are evicted
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra attempts at persisting a mutated node before giving up
    #[serde(rename = "flush-retries")]
    pub flush_retries: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            flush_retries: 2,
        }
    }
}

/// Background eviction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}
