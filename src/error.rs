//! Error types for echocast

use thiserror::Error;

/// Result type alias for echocast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in echocast
///
/// Every variant is recoverable: failures surface to the user as a status
/// message and the affected session returns to idle.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// TTS or audio conversion failed
    #[error("audio prep error: {0}")]
    Prep(String),

    /// Device unreachable or no device selected
    #[error("connection error: {0}")]
    Connection(String),

    /// Target device refused playback
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Mid-playback failure
    #[error("playback error: {0}")]
    Playback(String),

    /// Audio server bind or file I/O failure
    #[error("server error: {0}")]
    Server(String),

    /// Chat channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// Device discovery error
    #[error("discovery error: {0}")]
    Discovery(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("toml serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl Error {
    /// Short machine-readable label for the error category, used in
    /// progress events and user-facing status lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prep(_) => "prep",
            Self::Connection(_) => "connection",
            Self::DeviceBusy(_) => "device_busy",
            Self::Playback(_) => "playback",
            Self::Server(_) | Self::Io(_) => "server",
            Self::Channel(_) | Self::Http(_) => "channel",
            Self::Discovery(_) => "discovery",
            Self::Config(_) | Self::Serialization(_) | Self::Toml(_) | Self::TomlSer(_) => {
                "config"
            }
        }
    }
}
