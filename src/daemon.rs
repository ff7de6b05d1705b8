//! Daemon - the bot service
//!
//! Wires the Telegram channel to the playback orchestrator: authorizes
//! senders, handles commands and the setup flow, and turns playback
//! progress into status-message edits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::channels::telegram::{
    BotCommand, TelegramChannel, CALLBACK_CANCEL_SETUP, CALLBACK_SELECT_PREFIX,
};
use crate::channels::{ChatEvent, EventKind};
use crate::device::Device;
use crate::orchestrator::{ConnectOutcome, Orchestrator, PreparedAudio, ProgressEvent};
use crate::tts::{self, SaySynthesizer, SpeechSynthesizer};
use crate::{discovery, Config, Error, Result};

/// Discovery window for /setup; slow receivers need the long scan
const SETUP_DISCOVERY: Duration = Duration::from_secs(15);

/// Discovery window for /devices
const LIST_DISCOVERY: Duration = Duration::from_secs(5);

/// Cells in the playback progress bar
const PROGRESS_CELLS: usize = 10;

const HELP_TEXT: &str = "Welcome to echocast!\n\n\
Send me a voice message or text and I'll play it on your device.\n\n\
Commands:\n\
/setup - Configure playback device\n\
/connect - Wake up and connect to device\n\
/status - Show current device\n\
/devices - List available devices\n\
/help - Show this help message";

/// The echocast daemon
pub struct Daemon {
    config: Config,
    orchestrator: Arc<Orchestrator>,
}

struct HandlerCtx {
    channel: TelegramChannel,
    orchestrator: Arc<Orchestrator>,
    synth: Arc<dyn SpeechSynthesizer>,
    ffmpeg_path: String,
    allowed_users: Vec<i64>,
    /// Devices offered by the last /setup per chat, for callback lookup
    pending_setups: Mutex<HashMap<i64, Vec<Device>>>,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the device store cannot be read
    pub fn new(config: Config) -> Result<Self> {
        let orchestrator = Arc::new(Orchestrator::new(&config)?);
        Ok(Self {
            config,
            orchestrator,
        })
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the Telegram token is rejected
    pub async fn run(self) -> Result<()> {
        let (channel, mut events) =
            TelegramChannel::with_receiver(self.config.telegram.token.clone());
        let username = channel.verify_token().await?;
        tracing::info!(bot = %username, "daemon starting");

        if let Err(e) = channel.sync_commands(&bot_commands()).await {
            tracing::warn!(error = %e, "could not sync bot commands");
        }

        if self.config.telegram.allowed_users.is_empty() {
            tracing::warn!("no allowed users configured; accepting commands from anyone");
        }

        let poller =
            channel.start_polling(Duration::from_millis(self.config.telegram.poll_interval_ms));

        let ctx = Arc::new(HandlerCtx {
            channel,
            orchestrator: Arc::clone(&self.orchestrator),
            synth: Arc::new(SaySynthesizer::new(self.config.tts.clone())),
            ffmpeg_path: self.config.tts.ffmpeg_path.clone(),
            allowed_users: self.config.telegram.allowed_users.clone(),
            pending_setups: Mutex::new(HashMap::new()),
        });

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, shutting down");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("event stream closed");
                        break;
                    };
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        handle_event(&ctx, event).await;
                    });
                }
            }
        }

        poller.abort();
        self.orchestrator.shutdown().await;
        tracing::info!("daemon stopped");
        Ok(())
    }
}

fn bot_commands() -> Vec<BotCommand> {
    [
        ("start", "Show the welcome message"),
        ("help", "Show available commands"),
        ("setup", "Configure the playback device"),
        ("connect", "Wake up and connect to the device"),
        ("status", "Show the current device and playback state"),
        ("devices", "List available devices"),
    ]
    .into_iter()
    .map(|(command, description)| BotCommand {
        command: command.to_string(),
        description: description.to_string(),
    })
    .collect()
}

async fn handle_event(ctx: &HandlerCtx, event: ChatEvent) {
    if !ctx.allowed_users.is_empty() && !ctx.allowed_users.contains(&event.sender_id) {
        tracing::warn!(
            sender_id = event.sender_id,
            sender = %event.sender_name,
            "unauthorized access attempt"
        );
        return;
    }

    let chat_id = event.chat_id;
    let outcome = match event.kind {
        EventKind::Command { name, args } => handle_command(ctx, chat_id, &name, &args).await,
        EventKind::Callback {
            id,
            data,
            message_id,
        } => handle_callback(ctx, chat_id, &id, &data, message_id).await,
        EventKind::Text(text) => handle_text(ctx, chat_id, &text).await,
        EventKind::Voice { file_id } => handle_voice(ctx, chat_id, &file_id).await,
        EventKind::Audio { file_id } => handle_audio(ctx, chat_id, &file_id).await,
    };

    if let Err(e) = outcome {
        tracing::error!(chat_id, error = %e, "event handling failed");
    }
}

async fn handle_command(ctx: &HandlerCtx, chat_id: i64, name: &str, _args: &str) -> Result<()> {
    match name {
        "start" | "help" => ctx.channel.send_message(chat_id, HELP_TEXT).await,
        "setup" => handle_setup(ctx, chat_id).await,
        "connect" => handle_connect(ctx, chat_id).await,
        "status" => handle_status(ctx, chat_id).await,
        "devices" => handle_devices(ctx, chat_id).await,
        other => {
            tracing::debug!(chat_id, command = other, "unknown command");
            ctx.channel
                .send_message(chat_id, "Unknown command. Use /help to see what I can do.")
                .await
        }
    }
}

async fn handle_setup(ctx: &HandlerCtx, chat_id: i64) -> Result<()> {
    ctx.channel
        .send_message(
            chat_id,
            "Starting device setup...\n\nScanning for devices on your network, \
             this takes about 15 seconds.",
        )
        .await?;

    let devices = discovery::discover(SETUP_DISCOVERY).await;
    let text = setup_prompt(&devices);
    ctx.channel
        .send_device_keyboard(chat_id, &text, &devices)
        .await?;
    ctx.pending_setups.lock().await.insert(chat_id, devices);
    Ok(())
}

async fn handle_callback(
    ctx: &HandlerCtx,
    chat_id: i64,
    callback_id: &str,
    data: &str,
    message_id: i64,
) -> Result<()> {
    ctx.channel.answer_callback_query(callback_id, None).await?;

    if data == CALLBACK_CANCEL_SETUP {
        ctx.pending_setups.lock().await.remove(&chat_id);
        return ctx
            .channel
            .edit_message_text(chat_id, message_id, "Setup cancelled.")
            .await;
    }

    if let Some(device_id) = data.strip_prefix(CALLBACK_SELECT_PREFIX) {
        let selected = ctx
            .pending_setups
            .lock()
            .await
            .get(&chat_id)
            .and_then(|devices| devices.iter().find(|d| d.id == device_id).cloned());

        let Some(device) = selected else {
            return ctx
                .channel
                .edit_message_text(
                    chat_id,
                    message_id,
                    "Device not found. Please run /setup again.",
                )
                .await;
        };

        ctx.orchestrator.select_device(chat_id, &device).await?;
        ctx.pending_setups.lock().await.remove(&chat_id);

        let text = format!(
            "Setup complete!\n\nSelected device: {}\nType: {}\n\n\
             Send me text or a voice message and it will play there.\n\
             Use /status to check, /setup to change.",
            device.name, device.device_type
        );
        return ctx
            .channel
            .edit_message_text(chat_id, message_id, &text)
            .await;
    }

    tracing::debug!(chat_id, data, "unrecognized callback payload");
    Ok(())
}

async fn handle_connect(ctx: &HandlerCtx, chat_id: i64) -> Result<()> {
    let Some(device) = ctx.orchestrator.selected_device(chat_id).await else {
        return ctx
            .channel
            .send_message(chat_id, "No device configured. Use /setup first.")
            .await;
    };

    if device.is_local() {
        let text = format!("{} doesn't need a connection (local playback).", device.name);
        return ctx.channel.send_message(chat_id, &text).await;
    }

    let status_id = ctx
        .channel
        .send_message_returning_id(
            chat_id,
            &format!(
                "[ o ] Connecting to {}...\n\nThis may wake up the device.",
                device.name
            ),
        )
        .await?;

    let text = match ctx.orchestrator.connect(chat_id).await {
        Ok(ConnectOutcome::AlreadyConnected) => {
            format!("Already connected to {}", device.name)
        }
        Ok(ConnectOutcome::Connected) => format!(
            "Connected to {}\n\nDevice is ready. You can now send text or voice messages.",
            device.name
        ),
        Err(e) => {
            tracing::warn!(chat_id, error = %e, "connect failed");
            format!(
                "Failed to connect to {}\n\nMake sure the device is powered on \
                 and on the same network.",
                device.name
            )
        }
    };
    ctx.channel
        .edit_message_text(chat_id, status_id, &text)
        .await
}

async fn handle_status(ctx: &HandlerCtx, chat_id: i64) -> Result<()> {
    let report = ctx.orchestrator.status(chat_id).await;
    let text = match &report.device {
        Some(device) => {
            let mut text = format!(
                "Current device:\n  Name: {}\n  Type: {}\n",
                device.name, device.device_type
            );
            if let Some(address) = &device.address {
                text.push_str(&format!("  Address: {address}\n"));
            }
            text.push_str(&format!(
                "  Connected: {}\n  Playback: {}",
                if report.connected { "yes" } else { "no" },
                report.state
            ));
            text
        }
        None => "No device selected. Use /setup to configure.".to_string(),
    };
    ctx.channel.send_message(chat_id, &text).await
}

async fn handle_devices(ctx: &HandlerCtx, chat_id: i64) -> Result<()> {
    ctx.channel
        .send_message(chat_id, "Scanning for devices...")
        .await?;

    // Discovery always includes the local speakers, so there is at least
    // one device to list.
    let devices = discovery::discover(LIST_DISCOVERY).await;
    let mut text = if devices.iter().all(Device::is_local) {
        "No cast devices found on your network.\n\nAvailable devices:\n\n".to_string()
    } else {
        "Available devices:\n\n".to_string()
    };
    for (index, device) in devices.iter().enumerate() {
        text.push_str(&format!(
            "{}. {} ({})\n",
            index + 1,
            device.name,
            device.device_type
        ));
    }
    ctx.channel.send_message(chat_id, &text).await
}

/// Keyboard caption for /setup. Discovery always offers the local speakers,
/// so "nothing found" means no cast receivers answered the scan.
fn setup_prompt(devices: &[Device]) -> String {
    if devices.iter().all(Device::is_local) {
        "No cast devices found. Make sure your Google Home or Chromecast is on \
         the same network and try /setup again, or pick the local speakers:"
            .to_string()
    } else {
        format!(
            "Found {} device(s).\nTap to select your playback device:",
            devices.len()
        )
    }
}

async fn handle_text(ctx: &HandlerCtx, chat_id: i64, text: &str) -> Result<()> {
    let spoken = tts::expand_variables(text);
    let synth = Arc::clone(&ctx.synth);
    let prep = async move {
        let output = temp_audio_path("mp3");
        synth.synthesize(&spoken, &output).await?;
        Ok(PreparedAudio {
            path: output,
            cleanup: true,
        })
    };
    run_playback_flow(ctx, chat_id, prep).await
}

async fn handle_voice(ctx: &HandlerCtx, chat_id: i64, file_id: &str) -> Result<()> {
    let channel = ctx.channel.clone();
    let ffmpeg_path = ctx.ffmpeg_path.clone();
    let file_id = file_id.to_string();
    let prep = async move {
        let (data, _) = channel
            .download_file(&file_id)
            .await
            .map_err(|e| prep_failure("voice download", e))?;
        let ogg = temp_audio_path("ogg");
        tokio::fs::write(&ogg, &data)
            .await
            .map_err(|e| prep_failure("staging voice note", e))?;
        let playable = tts::normalize_voice_message(&ffmpeg_path, &ogg).await;
        if playable != ogg {
            let _ = tokio::fs::remove_file(&ogg).await;
        }
        Ok(PreparedAudio {
            path: playable,
            cleanup: true,
        })
    };
    run_playback_flow(ctx, chat_id, prep).await
}

async fn handle_audio(ctx: &HandlerCtx, chat_id: i64, file_id: &str) -> Result<()> {
    let channel = ctx.channel.clone();
    let file_id = file_id.to_string();
    let prep = async move {
        let (data, file_path) = channel
            .download_file(&file_id)
            .await
            .map_err(|e| prep_failure("audio download", e))?;
        let ext = std::path::Path::new(&file_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp3")
            .to_string();
        let path = temp_audio_path(&ext);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| prep_failure("staging audio file", e))?;
        Ok(PreparedAudio {
            path,
            cleanup: true,
        })
    };
    run_playback_flow(ctx, chat_id, prep).await
}

/// Start a playback and mirror its progress into one status message
async fn run_playback_flow<F>(ctx: &HandlerCtx, chat_id: i64, prep: F) -> Result<()>
where
    F: std::future::Future<Output = Result<PreparedAudio>> + Send + 'static,
{
    let Some(device) = ctx.orchestrator.selected_device(chat_id).await else {
        return ctx
            .channel
            .send_message(
                chat_id,
                "No device configured. Use /setup to select a playback device.",
            )
            .await;
    };

    let status_id = ctx
        .channel
        .send_message_returning_id(chat_id, &format!("[ o ] Processing\n\n{}", device.name))
        .await?;

    let (tx, mut rx) = mpsc::channel(16);
    ctx.orchestrator.play(chat_id, prep, tx).await?;

    while let Some(event) = rx.recv().await {
        let text = render_progress(&event, &device.name);
        match event {
            ProgressEvent::Complete | ProgressEvent::Error { .. } => {
                // Terminal states always land, bypassing the edit throttle
                if let Err(e) = ctx.channel.edit_message_text(chat_id, status_id, &text).await {
                    tracing::debug!(chat_id, error = %e, "final status edit failed");
                }
            }
            _ => ctx.channel.edit_throttled(chat_id, status_id, &text).await,
        }
    }
    Ok(())
}

fn render_progress(event: &ProgressEvent, device_name: &str) -> String {
    match event {
        ProgressEvent::Preparing => format!("[ o ] Converting to speech\n\n{device_name}"),
        ProgressEvent::Connecting { device } => format!("[ o ] Connecting to {device}..."),
        ProgressEvent::Serving => format!("[ o ] Serving audio\n\n{device_name}"),
        ProgressEvent::Playing {
            position_secs,
            duration_secs,
        } => format!(
            "> Playing  {}\n\n{device_name}",
            progress_bar(*position_secs, *duration_secs)
        ),
        ProgressEvent::Complete => format!("Playback complete\n\n{device_name}"),
        ProgressEvent::Error { kind, message } => match *kind {
            "prep" => "TTS conversion failed".to_string(),
            "device_busy" => format!("Device busy\n\n{message}"),
            _ => format!("Playback failed\n\n{device_name}\n{message}"),
        },
    }
}

/// Coarse text progress bar, full-width when the duration is unknown yet
fn progress_bar(position_secs: f64, duration_secs: f64) -> String {
    let filled = if duration_secs > 0.0 {
        let ratio = (position_secs / duration_secs).clamp(0.0, 1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let cells = (ratio * PROGRESS_CELLS as f64).round() as usize;
        cells.min(PROGRESS_CELLS)
    } else {
        0
    };
    format!(
        "{}{}",
        "▓".repeat(filled),
        "░".repeat(PROGRESS_CELLS - filled)
    )
}

/// Anything that fails while staging audio is a prep failure, whatever the
/// underlying cause, so progress rendering picks the prep message.
fn prep_failure(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Prep(format!("{what}: {e}"))
}

fn temp_audio_path(ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("echocast-{}.{ext}", uuid::Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_empty_and_full() {
        assert_eq!(progress_bar(0.0, 10.0), "░░░░░░░░░░");
        assert_eq!(progress_bar(10.0, 10.0), "▓▓▓▓▓▓▓▓▓▓");
    }

    #[test]
    fn progress_bar_halfway() {
        assert_eq!(progress_bar(5.0, 10.0), "▓▓▓▓▓░░░░░");
    }

    #[test]
    fn progress_bar_unknown_duration() {
        assert_eq!(progress_bar(3.0, 0.0), "░░░░░░░░░░");
    }

    #[test]
    fn temp_paths_are_unique() {
        assert_ne!(temp_audio_path("mp3"), temp_audio_path("mp3"));
    }

    #[test]
    fn staging_failures_render_as_prep_errors() {
        let err = prep_failure(
            "voice download",
            Error::Channel("getFile refused: not found".to_string()),
        );
        assert_eq!(err.kind(), "prep");

        let event = ProgressEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        };
        assert_eq!(render_progress(&event, "Kitchen"), "TTS conversion failed");
    }

    #[test]
    fn setup_prompt_flags_a_cast_free_network() {
        let only_local = [Device::local()];
        assert!(setup_prompt(&only_local).starts_with("No cast devices found"));

        let with_receiver = [
            Device::local(),
            Device {
                id: "abc".to_string(),
                name: "Den".to_string(),
                address: Some("192.0.2.10".to_string()),
                port: 8009,
                device_type: crate::device::DeviceType::Googlecast,
            },
        ];
        assert!(setup_prompt(&with_receiver).starts_with("Found 2 device(s)"));
    }

    #[test]
    fn error_rendering_by_kind() {
        let prep = ProgressEvent::Error {
            kind: "prep",
            message: "say failed".to_string(),
        };
        assert_eq!(render_progress(&prep, "Kitchen"), "TTS conversion failed");

        let busy = ProgressEvent::Error {
            kind: "device_busy",
            message: "another stream is active".to_string(),
        };
        assert!(render_progress(&busy, "Kitchen").starts_with("Device busy"));
    }
}
