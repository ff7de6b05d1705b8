//! Telegram adapter
//!
//! Long-polls the Bot API for updates, maps them to [`ChatEvent`]s, and
//! exposes the send/edit/keyboard surface the daemon drives. Every call is
//! a JSON POST to one Bot API method; [`TelegramChannel::call`] carries the
//! shared request/response plumbing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{parse_command, ChatEvent, EventKind};
use crate::device::Device;
use crate::{Error, Result};

const API_BASE: &str = "https://api.telegram.org/bot";
const FILE_BASE: &str = "https://api.telegram.org/file/bot";

/// Minimum spacing between status-message edits per chat; Telegram starts
/// answering 429 well below its documented limits when edits burst.
const EDIT_INTERVAL_MS: u64 = 1000;

/// Callback payload prefix carried by device-selection buttons
pub const CALLBACK_SELECT_PREFIX: &str = "select_";
/// Callback payload carried by the setup cancel button
pub const CALLBACK_CANCEL_SETUP: &str = "cancel_setup";

/// Spaces out message edits per chat
#[derive(Debug, Clone)]
pub struct EditThrottle {
    interval: Duration,
    last_edit: Arc<Mutex<HashMap<i64, Instant>>>,
}

impl EditThrottle {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_edit: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether an edit may go out for this chat right now. A `true` answer
    /// consumes the slot.
    pub fn admit(&self, chat_id: i64) -> bool {
        let mut map = self.last_edit.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(last) = map.get(&chat_id) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        map.insert(chat_id, now);
        true
    }

    /// A 429 came back: push this chat's next slot a full interval out
    pub fn penalize(&self, chat_id: i64) {
        let mut map = self.last_edit.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(chat_id, Instant::now() + self.interval);
    }
}

const SEEN_TTL_SECS: u64 = 300;
const SEEN_MAX_ENTRIES: usize = 2000;

/// Remembers recently handled update ids so a reconnect or offset hiccup
/// does not replay messages. TTL eviction with a hard entry cap.
#[derive(Debug)]
pub struct SeenUpdates {
    cache: HashMap<i64, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for SeenUpdates {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
            ttl: Duration::from_secs(SEEN_TTL_SECS),
            max_entries: SEEN_MAX_ENTRIES,
        }
    }
}

impl SeenUpdates {
    /// Record the id; reports `true` when it was already seen within the TTL
    pub fn is_duplicate(&mut self, update_id: i64) -> bool {
        let now = Instant::now();

        if self.cache.len() >= self.max_entries {
            self.cache.retain(|_, ts| now.duration_since(*ts) < self.ttl);
        }
        if self.cache.len() >= self.max_entries {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|(_, ts)| *ts)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                self.cache.remove(&id);
            }
        }

        if let Some(ts) = self.cache.get(&update_id) {
            if now.duration_since(*ts) < self.ttl {
                return true;
            }
        }
        self.cache.insert(update_id, now);
        false
    }
}

/// Telegram Bot API client plus the outgoing event stream
#[derive(Clone)]
pub struct TelegramChannel {
    token: String,
    client: Client,
    event_tx: Option<mpsc::Sender<ChatEvent>>,
    throttle: EditThrottle,
}

impl TelegramChannel {
    /// Send-only adapter; use [`Self::with_receiver`] to also poll
    #[must_use]
    pub fn new(token: String) -> Self {
        Self {
            token,
            client: Client::new(),
            event_tx: None,
            throttle: EditThrottle::new(Duration::from_millis(EDIT_INTERVAL_MS)),
        }
    }

    /// Adapter wired for polling, plus the receiving end of its event stream
    #[must_use]
    pub fn with_receiver(token: String) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(100);
        let mut channel = Self::new(token);
        channel.event_tx = Some(tx);
        (channel, rx)
    }

    /// POST one Bot API method and decode its response envelope
    async fn call<R, T>(&self, method: &str, request: &R) -> Result<(StatusCode, ApiResponse<T>)>
    where
        R: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{API_BASE}{}/{method}", self.token);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("{method} request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Channel(format!("{method} response unreadable: {e}")))?;
        let parsed: ApiResponse<T> = serde_json::from_str(&body)
            .map_err(|e| Error::Channel(format!("{method} response malformed: {e}")))?;
        Ok((status, parsed))
    }

    /// Like [`Self::call`], but the method must return a result
    async fn expect<R, T>(&self, method: &str, request: &R) -> Result<T>
    where
        R: Serialize + Sync,
        T: DeserializeOwned,
    {
        let (status, parsed) = self.call(method, request).await?;
        parsed.result.ok_or_else(|| {
            Error::Channel(format!(
                "{method} refused: {}",
                parsed.description.unwrap_or_else(|| status.to_string())
            ))
        })
    }

    /// Validate the bot token and return the bot's username
    ///
    /// # Errors
    ///
    /// Returns error if the token is rejected or the API is unreachable
    pub async fn verify_token(&self) -> Result<String> {
        let identity: BotIdentity = self.expect("getMe", &serde_json::json!({})).await?;
        tracing::info!(username = %identity.username, "Telegram token verified");
        Ok(identity.username)
    }

    /// Spawn the long-poll loop. Drops any webhook first (getUpdates and
    /// webhooks are mutually exclusive), then forwards message and callback
    /// updates as typed events.
    ///
    /// # Panics
    ///
    /// Panics if the adapter was built without a receiver (use
    /// [`Self::with_receiver`]).
    pub fn start_polling(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let channel = self.clone();
        let tx = self
            .event_tx
            .clone()
            .expect("start_polling requires an event receiver (use with_receiver)");

        tokio::spawn(async move {
            if let Err(e) = channel
                .call::<_, bool>("deleteWebhook", &serde_json::json!({}))
                .await
            {
                tracing::warn!(error = %e, "webhook removal before polling failed");
            }

            let mut offset: Option<i64> = None;
            let mut seen = SeenUpdates::default();

            loop {
                let mut params = serde_json::json!({
                    "timeout": 30,
                    "allowed_updates": ["message", "callback_query"],
                });
                if let Some(off) = offset {
                    params["offset"] = serde_json::json!(off);
                }

                match channel.call::<_, Vec<Update>>("getUpdates", &params).await {
                    Ok((_, response)) => {
                        for update in response.result.unwrap_or_default() {
                            offset = Some(update.update_id + 1);
                            if seen.is_duplicate(update.update_id) {
                                continue;
                            }
                            if let Some(event) = update_to_event(&update) {
                                if tx.send(event).await.is_err() {
                                    tracing::info!("event receiver gone, polling stops");
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "getUpdates poll failed");
                    }
                }

                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Send a plain-text message
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.send_message_returning_id(chat_id, text).await.map(|_| ())
    }

    /// Send a message and return its id so it can be edited later
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn send_message_returning_id(&self, chat_id: i64, text: &str) -> Result<i64> {
        let sent: SentMessage = self
            .expect(
                "sendMessage",
                &OutgoingMessage {
                    chat_id,
                    text: text.to_string(),
                    reply_markup: None,
                },
            )
            .await?;
        Ok(sent.message_id)
    }

    /// Replace an existing message's text
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails; a 429 also pushes back this
    /// chat's edit slot
    pub async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        let (status, parsed) = self
            .call::<_, serde_json::Value>(
                "editMessageText",
                &EditMessage {
                    chat_id,
                    message_id,
                    text: text.to_string(),
                },
            )
            .await?;
        if parsed.result.is_some() {
            return Ok(());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.throttle.penalize(chat_id);
        }
        Err(Error::Channel(format!(
            "editMessageText refused: {}",
            parsed.description.unwrap_or_else(|| status.to_string())
        )))
    }

    /// Edit a status message unless this chat edited too recently, in which
    /// case the update is silently dropped. Terminal states should use
    /// [`Self::edit_message_text`] directly so they always land.
    pub async fn edit_throttled(&self, chat_id: i64, message_id: i64, text: &str) {
        if !self.throttle.admit(chat_id) {
            return;
        }
        if let Err(e) = self.edit_message_text(chat_id, message_id, text).await {
            tracing::debug!(chat_id, message_id, error = %e, "throttled edit failed");
        }
    }

    /// Present a device picker: one button per device plus a cancel row.
    /// Presses come back as [`EventKind::Callback`] with
    /// `select_<id>` / `cancel_setup` payloads.
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn send_device_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        devices: &[Device],
    ) -> Result<i64> {
        let mut rows: Vec<Vec<KeyboardButton>> = devices
            .iter()
            .map(|device| {
                vec![KeyboardButton {
                    text: device.name.clone(),
                    callback_data: format!("{CALLBACK_SELECT_PREFIX}{}", device.id),
                }]
            })
            .collect();
        rows.push(vec![KeyboardButton {
            text: "Cancel".to_string(),
            callback_data: CALLBACK_CANCEL_SETUP.to_string(),
        }]);

        let sent: SentMessage = self
            .expect(
                "sendMessage",
                &OutgoingMessage {
                    chat_id,
                    text: text.to_string(),
                    reply_markup: Some(KeyboardMarkup {
                        inline_keyboard: rows,
                    }),
                },
            )
            .await?;
        Ok(sent.message_id)
    }

    /// Acknowledge a callback query so the client stops its spinner
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.expect::<_, serde_json::Value>(
            "answerCallbackQuery",
            &serde_json::json!({
                "callback_query_id": callback_id,
                "text": text,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Fetch a file's bytes by `file_id`: `getFile` resolves the path, the
    /// file endpoint serves the content. Returns the bytes and the remote
    /// path (useful for its extension).
    ///
    /// # Errors
    ///
    /// Returns error if the API request or the download fails
    pub async fn download_file(&self, file_id: &str) -> Result<(Vec<u8>, String)> {
        let file: RemoteFile = self
            .expect("getFile", &serde_json::json!({"file_id": file_id}))
            .await?;
        let file_path = file
            .file_path
            .ok_or_else(|| Error::Channel("getFile returned no file_path".to_string()))?;

        let download_url = format!("{FILE_BASE}{}/{file_path}", self.token);
        let data = self
            .client
            .get(&download_url)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("file download failed: {e}")))?
            .bytes()
            .await
            .map_err(|e| Error::Channel(format!("file download read failed: {e}")))?;

        Ok((data.to_vec(), file_path))
    }

    /// Publish the command menu via `setMyCommands`
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn sync_commands(&self, commands: &[BotCommand]) -> Result<()> {
        self.expect::<_, serde_json::Value>(
            "setMyCommands",
            &serde_json::json!({"commands": commands}),
        )
        .await?;
        tracing::info!(count = commands.len(), "bot command menu synced");
        Ok(())
    }
}

/// Envelope every Bot API response arrives in
#[derive(Deserialize)]
struct ApiResponse<T> {
    result: Option<T>,
    description: Option<String>,
}

#[derive(Serialize)]
struct OutgoingMessage {
    chat_id: i64,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<KeyboardMarkup>,
}

#[derive(Serialize)]
struct KeyboardMarkup {
    inline_keyboard: Vec<Vec<KeyboardButton>>,
}

#[derive(Serialize)]
struct KeyboardButton {
    text: String,
    callback_data: String,
}

#[derive(Serialize)]
struct EditMessage {
    chat_id: i64,
    message_id: i64,
    text: String,
}

/// An entry in the bot's command menu
#[derive(Debug, Clone, Serialize)]
pub struct BotCommand {
    /// Command name without the slash
    pub command: String,
    /// Menu description
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct BotIdentity {
    username: String,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct RemoteFile {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<IncomingMessage>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: ChatRef,
    from: Option<UserRef>,
    text: Option<String>,
    voice: Option<Attachment>,
    audio: Option<Attachment>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: UserRef,
    message: Option<CallbackSource>,
    data: Option<String>,
}

/// The message whose keyboard produced a callback
#[derive(Debug, Deserialize)]
struct CallbackSource {
    message_id: i64,
    chat: ChatRef,
}

#[derive(Debug, Deserialize)]
struct ChatRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct UserRef {
    id: i64,
    is_bot: bool,
    first_name: String,
}

/// Voice notes and audio uploads both reduce to a downloadable file id
#[derive(Debug, Deserialize)]
struct Attachment {
    file_id: String,
}

/// Map one update to a typed event. Messages from other bots and updates
/// with nothing playable are dropped.
fn update_to_event(update: &Update) -> Option<ChatEvent> {
    if let Some(callback) = &update.callback_query {
        let source = callback.message.as_ref()?;
        let data = callback.data.clone()?;
        return Some(ChatEvent {
            chat_id: source.chat.id,
            sender_id: callback.from.id,
            sender_name: callback.from.first_name.clone(),
            kind: EventKind::Callback {
                id: callback.id.clone(),
                data,
                message_id: source.message_id,
            },
        });
    }

    let msg = update.message.as_ref()?;
    if msg.from.as_ref().is_some_and(|u| u.is_bot) {
        return None;
    }

    let kind = if let Some(voice) = &msg.voice {
        EventKind::Voice {
            file_id: voice.file_id.clone(),
        }
    } else if let Some(audio) = &msg.audio {
        EventKind::Audio {
            file_id: audio.file_id.clone(),
        }
    } else if let Some(text) = &msg.text {
        if let Some((name, args)) = parse_command(text) {
            EventKind::Command { name, args }
        } else if text.trim().is_empty() {
            return None;
        } else {
            EventKind::Text(text.clone())
        }
    } else {
        return None;
    };

    Some(ChatEvent {
        chat_id: msg.chat.id,
        sender_id: msg.from.as_ref().map_or(msg.chat.id, |u| u.id),
        sender_name: msg
            .from
            .as_ref()
            .map_or_else(|| "Unknown".to_string(), |u| u.first_name.clone()),
        kind,
    })
}
