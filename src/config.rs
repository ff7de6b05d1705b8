//! Configuration management and selected-device persistence

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::{Error, Result};

/// echocast configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram channel configuration
    pub telegram: TelegramConfig,

    /// TTS / audio prep configuration
    pub tts: TtsConfig,

    /// Cast session timing
    pub cast: CastConfig,

    /// Audio server configuration
    pub server: ServerConfig,

    /// Directory for config and the selected-device store
    pub config_dir: PathBuf,
}

/// Telegram channel configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    /// Bot token (from `TELEGRAM_BOT_TOKEN`)
    #[serde(default)]
    pub token: String,

    /// User ids allowed to control the bot; empty allows everyone
    #[serde(default)]
    pub allowed_users: Vec<i64>,

    /// Pause between getUpdates polls, milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// TTS and audio conversion settings
#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfig {
    /// Voice name passed to the `say` engine (e.g. "Mei-Jia", "Samantha")
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Speech rate in words per minute
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Path to the `say` binary
    #[serde(default = "default_say_path")]
    pub say_path: String,

    /// Path to the `ffmpeg` binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            rate: default_rate(),
            say_path: default_say_path(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

/// Cast session timing configuration
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CastConfig {
    /// Device connect timeout, seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Keep-alive PING interval while connected, seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Transport status poll cadence, milliseconds
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            status_poll_ms: default_status_poll_ms(),
        }
    }
}

impl CastConfig {
    /// Connect timeout as a [`Duration`]
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Keep-alive interval as a [`Duration`]
    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Status poll cadence as a [`Duration`]
    #[must_use]
    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
}

/// Audio server configuration
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ServerConfig {
    /// Shut the server down after this long with no request, seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Idle timeout as a [`Duration`]
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_voice() -> String {
    "Mei-Jia".to_string()
}

fn default_rate() -> u32 {
    150
}

fn default_say_path() -> String {
    "say".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalive_secs() -> u64 {
    25
}

fn default_status_poll_ms() -> u64 {
    1000
}

fn default_idle_timeout_secs() -> u64 {
    120
}

/// On-disk layout of `echocast.toml`; every section is optional
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    telegram: TelegramConfig,
    #[serde(default)]
    tts: TtsConfig,
    #[serde(default)]
    cast: CastConfig,
    #[serde(default)]
    server: ServerConfig,
}

/// Return the config directory, creating it if needed
///
/// Uses `~/.config/echocast/` on Linux.
pub fn config_dir() -> PathBuf {
    let dir = directories::ProjectDirs::from("", "", "echocast")
        .map_or_else(|| PathBuf::from(".echocast"), |d| d.config_dir().to_path_buf());

    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(path = %dir.display(), error = %e, "failed to create config directory");
    }

    dir
}

impl Config {
    /// Load configuration from `echocast.toml` (if present) with environment
    /// overrides for the Telegram token and allowed users.
    ///
    /// # Errors
    ///
    /// Returns error if the config file exists but cannot be parsed, or if
    /// no Telegram token is configured.
    pub fn load() -> Result<Self> {
        let dir = config_dir();
        Self::load_from(&dir)
    }

    /// Load configuration rooted at an explicit directory
    ///
    /// # Errors
    ///
    /// Returns error if the config file exists but cannot be parsed, or if
    /// no Telegram token is configured.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join("echocast.toml");
        let mut file_config = FileConfig::default();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            file_config = toml::from_str(&raw)?;
            tracing::debug!(path = %path.display(), "loaded config file");
        }

        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            file_config.telegram.token = token;
        }
        if let Ok(users) = std::env::var("ECHOCAST_ALLOWED_USERS") {
            file_config.telegram.allowed_users = users
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect();
        }

        if file_config.telegram.token.is_empty() {
            return Err(Error::Config(
                "no Telegram bot token: set TELEGRAM_BOT_TOKEN or [telegram] token".to_string(),
            ));
        }

        Ok(Self {
            telegram: file_config.telegram,
            tts: file_config.tts,
            cast: file_config.cast,
            server: file_config.server,
            config_dir: dir.to_path_buf(),
        })
    }
}

/// Persisted selected-device wrapper
#[derive(Debug, Serialize, Deserialize)]
struct StoredSelection {
    selected_device: Option<Device>,
}

/// Persists the user's selected playback device as TOML
#[derive(Debug, Clone)]
pub struct DeviceStore {
    path: PathBuf,
}

impl DeviceStore {
    /// Create a store rooted at the given directory
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("device.toml"),
        }
    }

    /// Load the previously selected device, if any
    ///
    /// # Errors
    ///
    /// Returns error if the store file exists but cannot be read or parsed
    pub fn load(&self) -> Result<Option<Device>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let stored: StoredSelection = toml::from_str(&raw)?;
        Ok(stored.selected_device)
    }

    /// Persist the selected device
    ///
    /// # Errors
    ///
    /// Returns error if the store file cannot be written
    pub fn save(&self, device: &Device) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredSelection {
            selected_device: Some(device.clone()),
        };
        let raw = toml::to_string_pretty(&stored)?;
        std::fs::write(&self.path, raw)?;
        tracing::info!(device = %device.name, "selected device saved");
        Ok(())
    }
}
