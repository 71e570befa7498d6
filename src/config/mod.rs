//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calling::controller::CallSettings;
use crate::calling::media::MediaConstraints;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signaling relay WebSocket URL
    pub relay_url: String,
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
    pub ice: IceConfig,
    /// Who we are when `--as` is not given
    pub identity: Option<Identity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// How long to wait for the trip channel to be ready
    pub channel_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// How long to wait for camera/microphone access
    pub timeout_secs: u64,
    /// Microphone available
    pub audio: bool,
    /// Camera available
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Local address for the call socket (0.0.0.0 = default interface)
    pub bind_ip: IpAddr,
    pub check_timeout_secs: u64,
    pub consent_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8787".into(),
            signaling: SignalingConfig::default(),
            media: MediaConfig::default(),
            ice: IceConfig::default(),
            identity: None,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            channel_timeout_secs: 10,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            audio: true,
            video: true,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            check_timeout_secs: 15,
            consent_interval_secs: 5,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "ride-call", "ride-call")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from `path`; a missing file means defaults
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
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::default_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Identity may include an email address
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.signaling.channel_timeout_secs)
    }

    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            media_timeout: Duration::from_secs(self.media.timeout_secs),
            constraints: MediaConstraints {
                audio: self.media.audio,
                video: self.media.video,
            },
        }
    }
}
