//! Shared test utilities
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use echocast::cast::{DeviceLink, PlaybackSource, TransportSnapshot, TransportStatus};
use echocast::config::{CastConfig, Config, ServerConfig, TelegramConfig, TtsConfig};
use echocast::device::{Device, DeviceType};
use echocast::orchestrator::ProgressEvent;
use echocast::{Error, Result};
use tokio::sync::mpsc;

/// Build a config rooted at a temp dir with fast polling for tests
#[must_use]
pub fn test_config(dir: &Path) -> Config {
    Config {
        telegram: TelegramConfig::default(),
        tts: TtsConfig::default(),
        cast: CastConfig {
            connect_timeout_secs: 2,
            keepalive_secs: 25,
            status_poll_ms: 20,
        },
        server: ServerConfig {
            idle_timeout_secs: 120,
        },
        config_dir: dir.to_path_buf(),
    }
}

/// A fake cast receiver on the network
#[must_use]
pub fn cast_device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Receiver {id}"),
        address: Some("192.0.2.10".to_string()),
        port: 8009,
        device_type: DeviceType::Googlecast,
    }
}

/// Write a tiny placeholder audio file and return its path
#[must_use]
pub fn temp_audio(dir: &Path) -> PathBuf {
    let path = dir.join("clip.mp3");
    std::fs::write(&path, b"fake mp3 payload for tests").unwrap();
    path
}

/// Drain a progress channel until the playback task drops it
pub async fn collect_events(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Observable state shared between a test and its fake links
#[derive(Default)]
pub struct FakeLinkState {
    pub connects: usize,
    pub plays: usize,
    pub stops: usize,
    pub disconnects: usize,
    pub fail_connect: bool,
    pub busy_on_play: bool,
    /// Script a transport that keeps playing until stopped or superseded
    pub endless_play: bool,
    pub connected: bool,
    script: Vec<TransportSnapshot>,
    cursor: usize,
}

pub type SharedLinkState = Arc<Mutex<FakeLinkState>>;

#[must_use]
pub fn shared_link_state() -> SharedLinkState {
    Arc::new(Mutex::new(FakeLinkState::default()))
}

/// In-memory device link: accepting a play scripts a short
/// playing-then-finished snapshot sequence.
pub struct FakeLink {
    pub device_id: String,
    pub state: SharedLinkState,
}

fn playing(position_secs: f64, duration_secs: f64) -> TransportSnapshot {
    TransportSnapshot {
        status: TransportStatus::Playing,
        finished: false,
        position_secs,
        duration_secs,
    }
}

#[async_trait]
impl DeviceLink for FakeLink {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_connect {
            return Err(Error::Connection("fake device unreachable".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn play(&mut self, _source: &PlaybackSource) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.plays += 1;
        if state.busy_on_play {
            return Err(Error::DeviceBusy("another stream is active".to_string()));
        }
        state.script = if state.endless_play {
            // The cursor clamps to the last entry, so this never finishes.
            vec![playing(0.5, 60.0)]
        } else {
            vec![
                playing(0.5, 2.0),
                playing(1.5, 2.0),
                TransportSnapshot {
                    status: TransportStatus::Idle,
                    finished: true,
                    position_secs: 2.0,
                    duration_secs: 2.0,
                },
            ]
        };
        state.cursor = 0;
        Ok(())
    }

    fn snapshot(&self) -> TransportSnapshot {
        let mut state = self.state.lock().unwrap();
        if state.script.is_empty() {
            return TransportSnapshot::default();
        }
        let index = state.cursor.min(state.script.len() - 1);
        let snapshot = state.script[index];
        state.cursor += 1;
        snapshot
    }

    async fn stop(&mut self) -> Result<()> {
        self.state.lock().unwrap().stops += 1;
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        state.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}
