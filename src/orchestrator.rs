//! Playback orchestration
//!
//! Owns the per-chat sessions (selected device, link, playback state) and
//! walks each playback through prepare, connect, serve, and play. At most
//! one playback is in flight per chat; a new request cancels the previous
//! one and waits for its cleanup before starting. Every exit path releases
//! the audio server and temp files.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cast::{self, DeviceLink, PlaybackSource, TransportSnapshot, TransportStatus};
use crate::config::{CastConfig, Config, DeviceStore, ServerConfig};
use crate::device::Device;
use crate::server::AudioServer;
use crate::{Error, Result};

/// Grace period before an idle transport that never reported PLAYING is
/// treated as finished; very short clips can complete between two polls.
const QUICK_FINISH_GRACE: std::time::Duration = std::time::Duration::from_secs(8);

/// Where a session's playback currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Nothing in flight
    #[default]
    Idle,
    /// Rendering or converting audio
    PreparingAudio,
    /// Connecting to the device
    AwaitingConnection,
    /// Audio server up, device told to fetch
    Serving,
    /// Device reports playback
    Playing,
    /// Last playback ran to completion
    Complete,
    /// Last playback failed
    Error,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::PreparingAudio => "preparing audio",
            Self::AwaitingConnection => "connecting",
            Self::Serving => "serving",
            Self::Playing => "playing",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// Progress reported to whoever asked for the playback
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Audio is being rendered
    Preparing,
    /// Connecting to the named device
    Connecting {
        /// Device display name
        device: String,
    },
    /// Audio server is up, waiting for the device to fetch
    Serving,
    /// Device reports active playback
    Playing {
        /// Position, seconds
        position_secs: f64,
        /// Duration, seconds (0 when unknown)
        duration_secs: f64,
    },
    /// Playback ran to its natural end
    Complete,
    /// Playback failed
    Error {
        /// Error category label
        kind: &'static str,
        /// Human-readable description
        message: String,
    },
}

/// Prepared audio handed from the prep step to playback
#[derive(Debug, Clone)]
pub struct PreparedAudio {
    /// Path to the playable file
    pub path: PathBuf,
    /// Whether the file is ours to delete after playback
    pub cleanup: bool,
}

/// Result of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A link was established by this call
    Connected,
    /// The link was already up; nothing happened
    AlreadyConnected,
}

/// Point-in-time session report for status commands
#[derive(Debug)]
pub struct StatusReport {
    /// Currently selected device, if any
    pub device: Option<Device>,
    /// Whether the session's link is usable
    pub connected: bool,
    /// Playback state machine position
    pub state: PlaybackState,
    /// Latest transport snapshot
    pub snapshot: TransportSnapshot,
}

type LinkFactory = dyn Fn(&Device) -> Box<dyn DeviceLink> + Send + Sync;

struct InFlight {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

struct Session {
    device: std::sync::Mutex<Option<Device>>,
    link: tokio::sync::Mutex<Option<Box<dyn DeviceLink>>>,
    in_flight: tokio::sync::Mutex<Option<InFlight>>,
    state: std::sync::Mutex<PlaybackState>,
}

impl Session {
    fn new(device: Option<Device>) -> Self {
        Self {
            device: std::sync::Mutex::new(device),
            link: tokio::sync::Mutex::new(None),
            in_flight: tokio::sync::Mutex::new(None),
            state: std::sync::Mutex::new(PlaybackState::Idle),
        }
    }

    fn device(&self) -> Option<Device> {
        self.device.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn set_device(&self, device: Device) {
        if let Ok(mut current) = self.device.lock() {
            *current = Some(device);
        }
    }

    fn state(&self) -> PlaybackState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    fn set_state(&self, state: PlaybackState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

/// Coordinates devices, sessions, and playbacks
pub struct Orchestrator {
    cast: CastConfig,
    server: ServerConfig,
    store: DeviceStore,
    /// Most recent persisted selection; seeds sessions on first touch
    seed: std::sync::Mutex<Option<Device>>,
    sessions: tokio::sync::Mutex<HashMap<i64, Arc<Session>>>,
    link_factory: Arc<LinkFactory>,
}

impl Orchestrator {
    /// Create an orchestrator. The persisted device selection seeds each
    /// chat's session the first time the chat is seen.
    ///
    /// # Errors
    ///
    /// Returns error if the device store exists but cannot be read
    pub fn new(config: &Config) -> Result<Self> {
        let store = DeviceStore::new(&config.config_dir);
        let seed = store.load()?;
        if let Some(device) = &seed {
            tracing::info!(device = %device.name, "restored selected device");
        }
        let cast = config.cast;
        Ok(Self {
            cast,
            server: config.server,
            store,
            seed: std::sync::Mutex::new(seed),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            link_factory: Arc::new(move |device: &Device| cast::link_for(device, cast)),
        })
    }

    /// Replace how links are built. For exercising playback flows against
    /// in-memory devices.
    pub fn set_link_factory<F>(&mut self, factory: F)
    where
        F: Fn(&Device) -> Box<dyn DeviceLink> + Send + Sync + 'static,
    {
        self.link_factory = Arc::new(factory);
    }

    /// The chat's selected device
    pub async fn selected_device(&self, chat_id: i64) -> Option<Device> {
        self.session(chat_id).await.device()
    }

    /// Select and persist the playback device for this chat. The chat's
    /// in-flight playback is cancelled and its link to a different device
    /// is torn down; other chats keep their own selections untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the selection cannot be persisted
    pub async fn select_device(&self, chat_id: i64, device: &Device) -> Result<()> {
        self.store.save(device)?;
        if let Ok(mut seed) = self.seed.lock() {
            *seed = Some(device.clone());
        }

        let session = self.session(chat_id).await;
        cancel_in_flight(&session).await;
        {
            let mut link = session.link.lock().await;
            let stale = link.as_ref().is_some_and(|l| l.device_id() != device.id);
            if stale {
                if let Some(mut old) = link.take() {
                    old.disconnect().await;
                }
            }
        }
        session.set_device(device.clone());
        Ok(())
    }

    /// Connect the chat's session to its selected device. Idempotent: an
    /// already-connected session is left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if no device is selected or the device is unreachable
    pub async fn connect(&self, chat_id: i64) -> Result<ConnectOutcome> {
        let session = self.session(chat_id).await;
        let device = session
            .device()
            .ok_or_else(|| Error::Connection("no device selected".to_string()))?;
        let mut link = session.link.lock().await;

        if let Some(existing) = link.as_mut() {
            if existing.device_id() == device.id && existing.is_connected() {
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            existing.disconnect().await;
        }

        let mut fresh = (self.link_factory)(&device);
        fresh.connect().await?;
        *link = Some(fresh);
        Ok(ConnectOutcome::Connected)
    }

    /// Tear down the chat's link. Returns whether a link existed.
    pub async fn disconnect(&self, chat_id: i64) -> bool {
        let session = self.session(chat_id).await;
        cancel_in_flight(&session).await;
        let mut link = session.link.lock().await;
        if let Some(mut existing) = link.take() {
            existing.disconnect().await;
            session.set_state(PlaybackState::Idle);
            true
        } else {
            false
        }
    }

    /// Current session status for the chat
    pub async fn status(&self, chat_id: i64) -> StatusReport {
        let session = self.session(chat_id).await;
        let link = session.link.lock().await;
        StatusReport {
            device: session.device(),
            connected: link.as_ref().is_some_and(|l| l.is_connected()),
            state: session.state(),
            snapshot: link
                .as_ref()
                .map_or_else(TransportSnapshot::default, |l| l.snapshot()),
        }
    }

    /// Start a playback for the chat. `prep` renders or fetches the audio;
    /// it only runs once a device is selected. Any in-flight playback for
    /// the chat is cancelled first. Progress arrives on `progress`; this
    /// call returns as soon as the playback task is launched.
    ///
    /// # Errors
    ///
    /// Returns error if no device is selected
    pub async fn play<F>(
        &self,
        chat_id: i64,
        prep: F,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<()>
    where
        F: Future<Output = Result<PreparedAudio>> + Send + 'static,
    {
        let session = self.session(chat_id).await;
        let device = session
            .device()
            .ok_or_else(|| Error::Connection("no device selected".to_string()))?;

        let mut in_flight = session.in_flight.lock().await;
        if let Some(previous) = in_flight.take() {
            tracing::info!(chat_id, "cancelling in-flight playback");
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_playback(PlaybackCtx {
            session: Arc::clone(&session),
            device,
            cast: self.cast,
            server: self.server,
            factory: Arc::clone(&self.link_factory),
            progress,
            cancel: cancel.clone(),
            prep: Box::pin(prep),
        }));
        *in_flight = Some(InFlight { cancel, task });
        Ok(())
    }

    /// Cancel everything and tear down every link
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            cancel_in_flight(&session).await;
            let mut link = session.link.lock().await;
            if let Some(mut existing) = link.take() {
                existing.disconnect().await;
            }
        }
    }

    async fn session(&self, chat_id: i64) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(chat_id).or_insert_with(|| {
            let seeded = self.seed.lock().map(|d| d.clone()).unwrap_or_default();
            Arc::new(Session::new(seeded))
        }))
    }
}

async fn cancel_in_flight(session: &Session) {
    let mut in_flight = session.in_flight.lock().await;
    if let Some(previous) = in_flight.take() {
        previous.cancel.cancel();
        let _ = previous.task.await;
    }
}

type PrepFuture = std::pin::Pin<Box<dyn Future<Output = Result<PreparedAudio>> + Send>>;

struct PlaybackCtx {
    session: Arc<Session>,
    device: Device,
    cast: CastConfig,
    server: ServerConfig,
    factory: Arc<LinkFactory>,
    progress: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
    prep: PrepFuture,
}

enum Flow {
    Complete,
    Cancelled,
}

/// Drive one playback end to end, then clean up whatever was provisioned.
async fn run_playback(ctx: PlaybackCtx) {
    let session = Arc::clone(&ctx.session);
    let progress = ctx.progress.clone();
    let mut server: Option<AudioServer> = None;
    let mut prepared: Option<PreparedAudio> = None;

    let outcome = drive(ctx, &mut server, &mut prepared).await;

    if let Some(server) = server.take() {
        server.shutdown().await;
    }
    if let Some(prepared) = &prepared {
        if prepared.cleanup {
            if let Err(e) = tokio::fs::remove_file(&prepared.path).await {
                tracing::debug!(file = %prepared.path.display(), error = %e, "temp audio removal");
            }
        }
    }

    match outcome {
        Ok(Flow::Complete) => {
            session.set_state(PlaybackState::Complete);
            let _ = progress.send(ProgressEvent::Complete).await;
        }
        Ok(Flow::Cancelled) => {
            // Superseded or shut down: no terminal event, the replacement
            // playback owns the conversation now.
            session.set_state(PlaybackState::Idle);
        }
        Err(e) => {
            tracing::warn!(error = %e, "playback failed");
            session.set_state(PlaybackState::Error);
            let _ = progress
                .send(ProgressEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                })
                .await;
        }
    }
}

async fn drive(
    mut ctx: PlaybackCtx,
    server: &mut Option<AudioServer>,
    prepared: &mut Option<PreparedAudio>,
) -> Result<Flow> {
    let session = &ctx.session;

    // Prepare
    session.set_state(PlaybackState::PreparingAudio);
    let _ = ctx.progress.send(ProgressEvent::Preparing).await;
    let audio = tokio::select! {
        () = ctx.cancel.cancelled() => return Ok(Flow::Cancelled),
        result = &mut ctx.prep => result?,
    };
    *prepared = Some(audio.clone());
    if ctx.cancel.is_cancelled() {
        return Ok(Flow::Cancelled);
    }

    // Connect
    session.set_state(PlaybackState::AwaitingConnection);
    let _ = ctx.progress
        .send(ProgressEvent::Connecting {
            device: ctx.device.name.clone(),
        })
        .await;
    {
        let mut link = session.link.lock().await;
        let needs_fresh = link
            .as_ref()
            .map_or(true, |l| l.device_id() != ctx.device.id);
        if needs_fresh {
            if let Some(mut old) = link.take() {
                old.disconnect().await;
            }
            *link = Some((ctx.factory)(&ctx.device));
        }
        let active = link.as_mut().ok_or_else(|| {
            Error::Connection("link vanished during connect".to_string())
        })?;
        tokio::select! {
            () = ctx.cancel.cancelled() => return Ok(Flow::Cancelled),
            result = active.connect() => result?,
        }
    }

    // Serve (cast devices fetch over HTTP; the local player reads the file)
    let source = if ctx.device.is_local() {
        PlaybackSource::File(audio.path.clone())
    } else {
        session.set_state(PlaybackState::Serving);
        let _ = ctx.progress.send(ProgressEvent::Serving).await;
        let audio_server =
            AudioServer::start(audio.path.clone(), ctx.server.idle_timeout()).await?;
        let url = audio_server.url();
        let content_type = audio_server.content_type().to_string();
        *server = Some(audio_server);
        PlaybackSource::Url { url, content_type }
    };
    if ctx.cancel.is_cancelled() {
        return Ok(Flow::Cancelled);
    }

    // Load
    {
        let mut link = session.link.lock().await;
        let active = link
            .as_mut()
            .ok_or_else(|| Error::Connection("link lost before load".to_string()))?;
        tokio::select! {
            () = ctx.cancel.cancelled() => return Ok(Flow::Cancelled),
            result = active.play(&source) => result?,
        }
    }
    session.set_state(PlaybackState::Playing);

    // Poll until the transport goes idle. The lock is dropped between polls
    // so status queries stay responsive.
    let started = Instant::now();
    let mut saw_playing = false;
    loop {
        if ctx.cancel.is_cancelled() {
            let mut link = session.link.lock().await;
            if let Some(active) = link.as_mut() {
                let _ = active.stop().await;
            }
            return Ok(Flow::Cancelled);
        }

        let snapshot = {
            let link = session.link.lock().await;
            link.as_ref()
                .map_or_else(TransportSnapshot::default, |l| l.snapshot())
        };

        match snapshot.status {
            TransportStatus::Playing => {
                saw_playing = true;
                let _ = ctx.progress
                    .send(ProgressEvent::Playing {
                        position_secs: snapshot.position_secs,
                        duration_secs: snapshot.duration_secs,
                    })
                    .await;
            }
            TransportStatus::Buffering | TransportStatus::Paused => {}
            TransportStatus::Idle => {
                if snapshot.finished || saw_playing {
                    return Ok(Flow::Complete);
                }
                // Short clips can start and finish between polls; give the
                // receiver a grace window before concluding.
                if started.elapsed() > QUICK_FINISH_GRACE {
                    return Ok(Flow::Complete);
                }
            }
            TransportStatus::Error => {
                return Err(Error::Playback(
                    "device reported a transport error".to_string(),
                ));
            }
        }

        tokio::select! {
            () = ctx.cancel.cancelled() => {}
            () = tokio::time::sleep(ctx.cast.status_poll()) => {}
        }
    }
}
