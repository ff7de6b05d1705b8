//! Google Cast control-channel link
//!
//! Receivers expose a TLS socket on port 8009 with self-signed
//! certificates. The blocking socket is owned by a dedicated worker thread
//! that pumps heartbeats and media status; the async side talks to it
//! through an mpsc command channel and a watch channel carrying transport
//! snapshots.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};

use super::codec::{
    self, Frame, MediaStatus, DEFAULT_MEDIA_RECEIVER_APP_ID, NAMESPACE_CONNECTION,
    NAMESPACE_HEARTBEAT, NAMESPACE_MEDIA, NAMESPACE_RECEIVER,
};
use super::{DeviceLink, PlaybackSource, TransportSnapshot, TransportStatus};
use crate::config::CastConfig;
use crate::device::Device;
use crate::{Error, Result};

const SENDER_ID: &str = "sender-echocast";
const PLATFORM_RECEIVER_ID: &str = "receiver-0";

/// Read timeout while the worker pumps; sets the loop cadence
const PUMP_READ_TIMEOUT: Duration = Duration::from_millis(250);
/// Read timeout during the TLS handshake and app launch
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(3);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1500);
/// How long the receiver gets to answer a LOAD before we give up
const LOAD_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Load {
        url: String,
        content_type: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

struct Worker {
    commands: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<TransportSnapshot>,
    thread: std::thread::JoinHandle<()>,
}

/// Link to one Google Cast receiver
pub struct GoogleCastLink {
    device: Device,
    config: CastConfig,
    worker: Option<Worker>,
}

impl GoogleCastLink {
    /// Create an unconnected link to the given receiver
    #[must_use]
    pub fn new(device: Device, config: CastConfig) -> Self {
        Self {
            device,
            config,
            worker: None,
        }
    }

    fn live_worker(&self) -> Option<&Worker> {
        self.worker.as_ref().filter(|w| !w.thread.is_finished())
    }
}

#[async_trait]
impl DeviceLink for GoogleCastLink {
    async fn connect(&mut self) -> Result<()> {
        if self.live_worker().is_some() {
            tracing::debug!(device = %self.device.name, "cast link already up");
            return Ok(());
        }
        self.worker = None;

        let device = self.device.clone();
        let handshake = tokio::task::spawn_blocking(move || Conduit::establish(&device));
        let conduit = tokio::time::timeout(self.config.connect_timeout(), handshake)
            .await
            .map_err(|_| {
                Error::Connection(format!("timed out connecting to {}", self.device.name))
            })?
            .map_err(|e| Error::Connection(format!("connect task failed: {e}")))??;

        let (command_tx, command_rx) = mpsc::channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(TransportSnapshot::default());
        let config = self.config;
        let device_name = self.device.name.clone();
        let thread = std::thread::Builder::new()
            .name("cast-link".to_string())
            .spawn(move || conduit.run(&command_rx, &snapshot_tx, config, &device_name))?;

        self.worker = Some(Worker {
            commands: command_tx,
            snapshot_rx,
            thread,
        });
        tracing::info!(device = %self.device.name, "cast link established");
        Ok(())
    }

    async fn play(&mut self, source: &PlaybackSource) -> Result<()> {
        let PlaybackSource::Url { url, content_type } = source else {
            return Err(Error::Playback(
                "cast receivers can only play URL sources".to_string(),
            ));
        };
        let worker = self
            .live_worker()
            .ok_or_else(|| Error::Connection("cast link is not connected".to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .commands
            .send(Command::Load {
                url: url.clone(),
                content_type: content_type.clone(),
                reply: reply_tx,
            })
            .map_err(|_| Error::Connection("cast link worker stopped".to_string()))?;

        match tokio::time::timeout(LOAD_TIMEOUT + Duration::from_secs(2), reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Connection("cast link dropped mid-load".to_string())),
            Err(_) => Err(Error::Playback(
                "receiver did not answer the load request".to_string(),
            )),
        }
    }

    fn snapshot(&self) -> TransportSnapshot {
        self.worker
            .as_ref()
            .map_or_else(TransportSnapshot::default, |w| *w.snapshot_rx.borrow())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.live_worker() else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if worker.commands.send(Command::Stop { reply: reply_tx }).is_err() {
            return Ok(());
        }
        match tokio::time::timeout(Duration::from_secs(3), reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            _ => Ok(()),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.commands.send(Command::Disconnect);
            // The worker tears the channel down and exits on its own; joining
            // here would block the runtime.
            tracing::info!(device = %self.device.name, "cast link disconnect requested");
        }
    }

    fn is_connected(&self) -> bool {
        self.live_worker().is_some()
    }

    fn device_id(&self) -> &str {
        &self.device.id
    }
}

/// The receiver-facing half: owns the TLS socket, runs on the worker thread
struct Conduit {
    stream: native_tls::TlsStream<TcpStream>,
    transport_id: String,
    app_session_id: String,
    next_request_id: i64,
}

impl Conduit {
    /// Connect, launch the Default Media Receiver, and join its transport.
    ///
    /// Blocking; run on a worker task with an outer timeout.
    fn establish(device: &Device) -> Result<Self> {
        let address = device
            .address
            .as_deref()
            .ok_or_else(|| Error::Connection("cast device has no address".to_string()))?;
        let target = format!("{}:{}", address, device.port);
        let socket_addr = target
            .parse()
            .map_err(|e| Error::Connection(format!("invalid cast address {target}: {e}")))?;

        let tcp = TcpStream::connect_timeout(&socket_addr, Duration::from_secs(6))
            .map_err(|e| Error::Connection(format!("cannot reach {target}: {e}")))?;
        tcp.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT))?;
        tcp.set_write_timeout(Some(WRITE_TIMEOUT))?;

        // Receivers present self-signed certificates for their own names.
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| Error::Connection(format!("tls setup failed: {e}")))?;
        let stream = connector
            .connect(address, tcp)
            .map_err(|e| Error::Connection(format!("tls handshake with {target} failed: {e}")))?;

        let mut conduit = Self {
            stream,
            transport_id: PLATFORM_RECEIVER_ID.to_string(),
            app_session_id: String::new(),
            next_request_id: 1,
        };

        conduit.send_json(
            NAMESPACE_CONNECTION,
            PLATFORM_RECEIVER_ID,
            json!({"type": "CONNECT", "origin": {}}),
        )?;
        let request_id = conduit.alloc_request_id();
        conduit.send_json(
            NAMESPACE_RECEIVER,
            PLATFORM_RECEIVER_ID,
            json!({
                "type": "LAUNCH",
                "appId": DEFAULT_MEDIA_RECEIVER_APP_ID,
                "requestId": request_id
            }),
        )?;

        let (transport_id, app_session_id) =
            conduit.await_media_transport(Duration::from_secs(8))?;
        conduit.transport_id = transport_id;
        conduit.app_session_id = app_session_id;
        conduit.send_json(
            NAMESPACE_CONNECTION,
            &conduit.transport_id.clone(),
            json!({"type": "CONNECT", "origin": {}}),
        )?;

        conduit.stream.get_ref().set_read_timeout(Some(PUMP_READ_TIMEOUT))?;
        Ok(conduit)
    }

    /// Worker loop: drain commands, pump receiver traffic, keep the link
    /// alive, and publish transport snapshots. Returns when asked to
    /// disconnect, when the link owner is gone, or on socket failure.
    fn run(
        mut self,
        commands: &mpsc::Receiver<Command>,
        snapshot_tx: &watch::Sender<TransportSnapshot>,
        config: CastConfig,
        device_name: &str,
    ) {
        let mut snapshot = TransportSnapshot::default();
        let mut last_ping = Instant::now();
        let mut last_status_poll = Instant::now();

        loop {
            match commands.try_recv() {
                Ok(Command::Load {
                    url,
                    content_type,
                    reply,
                }) => {
                    let outcome = self.load_and_await(&url, &content_type);
                    if outcome.is_ok() {
                        snapshot = TransportSnapshot {
                            status: TransportStatus::Buffering,
                            ..TransportSnapshot::default()
                        };
                        let _ = snapshot_tx.send(snapshot);
                    }
                    let _ = reply.send(outcome);
                }
                Ok(Command::Stop { reply }) => {
                    let _ = reply.send(self.stop_media());
                }
                Ok(Command::Disconnect) | Err(mpsc::TryRecvError::Disconnected) => {
                    self.teardown();
                    tracing::debug!(device = device_name, "cast link worker exiting");
                    return;
                }
                Err(mpsc::TryRecvError::Empty) => {}
            }

            match self.pump(&mut snapshot) {
                Ok(true) => {
                    let _ = snapshot_tx.send(snapshot);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(device = device_name, error = %e, "cast link lost");
                    snapshot.status = TransportStatus::Error;
                    let _ = snapshot_tx.send(snapshot);
                    return;
                }
            }

            if last_ping.elapsed() >= config.keepalive() {
                if let Err(e) = self.send_json(
                    NAMESPACE_HEARTBEAT,
                    PLATFORM_RECEIVER_ID,
                    json!({"type": "PING"}),
                ) {
                    tracing::warn!(device = device_name, error = %e, "keep-alive failed");
                    snapshot.status = TransportStatus::Error;
                    let _ = snapshot_tx.send(snapshot);
                    return;
                }
                last_ping = Instant::now();
            }

            if last_status_poll.elapsed() >= config.status_poll() {
                let request_id = self.alloc_request_id();
                let _ = self.send_json(
                    NAMESPACE_MEDIA,
                    &self.transport_id.clone(),
                    json!({"type": "GET_STATUS", "requestId": request_id}),
                );
                last_status_poll = Instant::now();
            }
        }
    }

    /// Read and handle pending receiver traffic. Returns whether the
    /// snapshot changed.
    fn pump(&mut self, snapshot: &mut TransportSnapshot) -> Result<bool> {
        let mut changed = false;
        while let Some(frame) = self.read_frame()? {
            if frame.namespace == NAMESPACE_HEARTBEAT {
                self.answer_ping(&frame.payload);
            } else if frame.namespace == NAMESPACE_MEDIA {
                if let Some(status) = codec::parse_media_status(&frame.payload) {
                    changed |= apply_media_status(snapshot, &status);
                }
            }
        }
        Ok(changed)
    }

    fn answer_ping(&mut self, payload: &str) {
        let is_ping = serde_json::from_str::<Value>(payload)
            .ok()
            .and_then(|v| v.get("type").and_then(Value::as_str).map(ToString::to_string))
            .is_some_and(|t| t == "PING");
        if is_ping {
            let _ = self.send_json(
                NAMESPACE_HEARTBEAT,
                PLATFORM_RECEIVER_ID,
                json!({"type": "PONG"}),
            );
        }
    }

    /// Send a LOAD and wait for the receiver's verdict: the first
    /// MEDIA_STATUS accepts it, LOAD_FAILED / LOAD_CANCELLED means another
    /// sender holds the receiver.
    fn load_and_await(&mut self, url: &str, content_type: &str) -> Result<()> {
        let request_id = self.alloc_request_id();
        self.send_json(
            NAMESPACE_MEDIA,
            &self.transport_id.clone(),
            json!({
                "type": "LOAD",
                "requestId": request_id,
                "autoplay": true,
                "media": {
                    "contentId": url,
                    "streamType": "BUFFERED",
                    "contentType": content_type,
                    "metadata": {"metadataType": 0}
                }
            }),
        )?;

        let deadline = Instant::now() + LOAD_TIMEOUT;
        while Instant::now() < deadline {
            let Some(frame) = self.read_frame()? else {
                continue;
            };
            if frame.namespace == NAMESPACE_HEARTBEAT {
                self.answer_ping(&frame.payload);
                continue;
            }
            if frame.namespace != NAMESPACE_MEDIA {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(&frame.payload) else {
                continue;
            };
            match value.get("type").and_then(Value::as_str) {
                Some("MEDIA_STATUS") => return Ok(()),
                Some("LOAD_FAILED" | "LOAD_CANCELLED") => {
                    return Err(Error::DeviceBusy(
                        "receiver refused the load; another stream is active".to_string(),
                    ));
                }
                _ => {}
            }
        }
        Err(Error::Playback(
            "receiver did not acknowledge the load".to_string(),
        ))
    }

    fn stop_media(&mut self) -> Result<()> {
        let request_id = self.alloc_request_id();
        self.send_json(
            NAMESPACE_MEDIA,
            &self.transport_id.clone(),
            json!({"type": "STOP", "requestId": request_id}),
        )
    }

    /// Best-effort teardown mirroring the connect sequence in reverse
    fn teardown(&mut self) {
        if let Err(e) = self.stop_media() {
            tracing::debug!(error = %e, "media stop during teardown failed");
        }
        if !self.app_session_id.is_empty() {
            let request_id = self.alloc_request_id();
            let session_id = self.app_session_id.clone();
            if let Err(e) = self.send_json(
                NAMESPACE_RECEIVER,
                PLATFORM_RECEIVER_ID,
                json!({"type": "STOP", "requestId": request_id, "sessionId": session_id}),
            ) {
                tracing::debug!(error = %e, "receiver app stop during teardown failed");
            }
        }
        for destination in [self.transport_id.clone(), PLATFORM_RECEIVER_ID.to_string()] {
            if let Err(e) =
                self.send_json(NAMESPACE_CONNECTION, &destination, json!({"type": "CLOSE"}))
            {
                tracing::debug!(error = %e, destination, "close during teardown failed");
            }
        }
    }

    fn await_media_transport(&mut self, timeout: Duration) -> Result<(String, String)> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let Some(frame) = self.read_frame()? else {
                continue;
            };
            if frame.namespace == NAMESPACE_HEARTBEAT {
                self.answer_ping(&frame.payload);
                continue;
            }
            if frame.namespace != NAMESPACE_RECEIVER {
                continue;
            }
            if let Some(ids) = codec::find_media_app(&frame.payload) {
                return Ok(ids);
            }
        }
        Err(Error::Connection(
            "receiver never reported the media app transport".to_string(),
        ))
    }

    fn alloc_request_id(&mut self) -> i64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn send_json(&mut self, namespace: &str, destination_id: &str, payload: Value) -> Result<()> {
        let frame = codec::encode_frame(SENDER_ID, destination_id, namespace, &payload.to_string())?;
        self.stream
            .write_all(&frame)
            .map_err(|e| Error::Connection(format!("cast frame send failed: {e}")))?;
        Ok(())
    }

    /// Read one frame, or `None` when the read timeout elapses with the
    /// socket quiet.
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(e) => return Err(Error::Connection(format!("cast frame read failed: {e}"))),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(None);
        }
        let mut body = vec![0u8; len];
        self.stream
            .read_exact(&mut body)
            .map_err(|e| Error::Connection(format!("cast frame body read failed: {e}")))?;
        Ok(Some(codec::decode_frame(&body)?))
    }
}

/// Fold one MEDIA_STATUS into the snapshot. Returns whether anything
/// observable changed.
fn apply_media_status(snapshot: &mut TransportSnapshot, status: &MediaStatus) -> bool {
    let new_status = match status.player_state.as_str() {
        "PLAYING" => TransportStatus::Playing,
        "BUFFERING" => TransportStatus::Buffering,
        "PAUSED" => TransportStatus::Paused,
        "IDLE" => match status.idle_reason.as_deref() {
            Some("ERROR") => TransportStatus::Error,
            _ => TransportStatus::Idle,
        },
        _ => snapshot.status,
    };
    let finished = snapshot.finished || status.idle_reason.as_deref() == Some("FINISHED");

    let changed = new_status != snapshot.status
        || finished != snapshot.finished
        || (status.position_secs - snapshot.position_secs).abs() > f64::EPSILON
        || (status.duration_secs - snapshot.duration_secs).abs() > f64::EPSILON;

    snapshot.status = new_status;
    snapshot.finished = finished;
    snapshot.position_secs = status.position_secs;
    snapshot.duration_secs = status.duration_secs;
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_status(state: &str, idle_reason: Option<&str>) -> MediaStatus {
        MediaStatus {
            player_state: state.to_string(),
            position_secs: 1.0,
            duration_secs: 4.0,
            idle_reason: idle_reason.map(ToString::to_string),
        }
    }

    #[test]
    fn playing_then_finished() {
        let mut snapshot = TransportSnapshot::default();
        assert!(apply_media_status(&mut snapshot, &media_status("PLAYING", None)));
        assert_eq!(snapshot.status, TransportStatus::Playing);
        assert!(!snapshot.finished);

        assert!(apply_media_status(
            &mut snapshot,
            &media_status("IDLE", Some("FINISHED"))
        ));
        assert_eq!(snapshot.status, TransportStatus::Idle);
        assert!(snapshot.finished);
    }

    #[test]
    fn idle_with_error_reason_is_error() {
        let mut snapshot = TransportSnapshot::default();
        apply_media_status(&mut snapshot, &media_status("IDLE", Some("ERROR")));
        assert_eq!(snapshot.status, TransportStatus::Error);
        assert!(!snapshot.finished);
    }

    #[test]
    fn interrupted_idle_is_plain_idle() {
        let mut snapshot = TransportSnapshot::default();
        apply_media_status(&mut snapshot, &media_status("PLAYING", None));
        apply_media_status(&mut snapshot, &media_status("IDLE", Some("INTERRUPTED")));
        assert_eq!(snapshot.status, TransportStatus::Idle);
        assert!(!snapshot.finished);
    }

    #[test]
    fn unknown_state_keeps_previous_status() {
        let mut snapshot = TransportSnapshot::default();
        apply_media_status(&mut snapshot, &media_status("PLAYING", None));
        apply_media_status(&mut snapshot, &media_status("LOADING", None));
        assert_eq!(snapshot.status, TransportStatus::Playing);
    }

    #[tokio::test]
    async fn play_requires_a_url_source() {
        let device = Device {
            id: "cast-1".to_string(),
            name: "Test".to_string(),
            address: Some("127.0.0.1".to_string()),
            port: 8009,
            device_type: crate::device::DeviceType::Googlecast,
        };
        let mut link = GoogleCastLink::new(device, CastConfig::default());
        let err = link
            .play(&PlaybackSource::File(std::path::PathBuf::from("a.mp3")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "playback");
    }

    #[tokio::test]
    async fn unconnected_link_refuses_play() {
        let device = Device {
            id: "cast-1".to_string(),
            name: "Test".to_string(),
            address: Some("127.0.0.1".to_string()),
            port: 8009,
            device_type: crate::device::DeviceType::Googlecast,
        };
        let mut link = GoogleCastLink::new(device, CastConfig::default());
        assert!(!link.is_connected());
        let err = link
            .play(&PlaybackSource::Url {
                url: "http://127.0.0.1:1/audio/x".to_string(),
                content_type: "audio/mpeg".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connection");
    }
}
