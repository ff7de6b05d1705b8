//! Playback device links
//!
//! A [`DeviceLink`] drives one playback target: the Google Cast control
//! channel for receivers, or this machine's speakers for the local player.
//! Links are connect-idempotent and survive across playbacks until
//! explicitly disconnected.

mod codec;
mod local;
mod session;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::CastConfig;
use crate::device::{Device, DeviceType};
use crate::Result;

pub use local::LocalPlayerLink;
pub use session::GoogleCastLink;

/// Receiver transport state, as last reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportStatus {
    /// Nothing loaded, or playback finished
    #[default]
    Idle,
    /// Media loaded, receiver buffering
    Buffering,
    /// Actively playing
    Playing,
    /// Paused by the receiver
    Paused,
    /// Transport reported a failure
    Error,
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Buffering => "buffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// Point-in-time view of the transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportSnapshot {
    /// Current transport state
    pub status: TransportStatus,

    /// Whether the last media item ran to its natural end
    pub finished: bool,

    /// Playback position, seconds
    pub position_secs: f64,

    /// Media duration, seconds (0 when unknown)
    pub duration_secs: f64,
}

/// What to play: a URL the device fetches itself, or a file the local
/// player reads directly.
#[derive(Debug, Clone)]
pub enum PlaybackSource {
    /// HTTP URL reachable from the device
    Url {
        /// Absolute URL
        url: String,
        /// MIME type of the audio
        content_type: String,
    },
    /// Local file path (local player only)
    File(PathBuf),
}

/// Uniform interface over playback targets
#[async_trait]
pub trait DeviceLink: Send {
    /// Establish (or re-establish) the link. Calling this on an already
    /// connected link is a no-op.
    async fn connect(&mut self) -> Result<()>;

    /// Start playing the given source. Returns once the device has accepted
    /// the media, not when playback ends.
    async fn play(&mut self, source: &PlaybackSource) -> Result<()>;

    /// Latest transport snapshot
    fn snapshot(&self) -> TransportSnapshot;

    /// Stop any current playback, keeping the link up
    async fn stop(&mut self) -> Result<()>;

    /// Tear the link down. Never fails; best-effort teardown.
    async fn disconnect(&mut self);

    /// Whether the link is currently usable
    fn is_connected(&self) -> bool;

    /// Id of the device this link drives
    fn device_id(&self) -> &str;
}

/// Build the appropriate link for a device
#[must_use]
pub fn link_for(device: &Device, config: CastConfig) -> Box<dyn DeviceLink> {
    match device.device_type {
        DeviceType::Googlecast => Box::new(GoogleCastLink::new(device.clone(), config)),
        DeviceType::LocalPlayer => Box::new(LocalPlayerLink::new()),
    }
}
