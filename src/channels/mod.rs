//! Chat front-ends
//!
//! The bot is driven entirely by chat events; this module defines the typed
//! event stream the daemon consumes and hosts the Telegram adapter.

pub mod telegram;

/// One event from the chat front-end
#[derive(Debug, Clone)]
pub struct ChatEvent {
    /// Chat the event belongs to
    pub chat_id: i64,
    /// User who triggered it
    pub sender_id: i64,
    /// Display name of the sender
    pub sender_name: String,
    /// What happened
    pub kind: EventKind,
}

/// The kinds of events the bot reacts to
#[derive(Debug, Clone)]
pub enum EventKind {
    /// Plain text to speak
    Text(String),
    /// A recorded voice note
    Voice {
        /// Platform file id for download
        file_id: String,
    },
    /// An uploaded audio file
    Audio {
        /// Platform file id for download
        file_id: String,
    },
    /// A slash command
    Command {
        /// Command name without the leading slash
        name: String,
        /// Everything after the command, trimmed
        args: String,
    },
    /// An inline-keyboard button press
    Callback {
        /// Callback query id, needed for the acknowledgement
        id: String,
        /// Opaque payload attached to the button
        data: String,
        /// Message carrying the keyboard
        message_id: i64,
    },
}

/// Split a `/command@botname args` line into name and args. The `@botname`
/// suffix appears in group chats and is dropped.
#[must_use]
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let rest = text.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head);
    if name.is_empty() {
        return None;
    }
    Some((name.to_ascii_lowercase(), args.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_command() {
        assert_eq!(
            parse_command("/status"),
            Some(("status".to_string(), String::new()))
        );
    }

    #[test]
    fn command_with_args() {
        assert_eq!(
            parse_command("/connect living room"),
            Some(("connect".to_string(), "living room".to_string()))
        );
    }

    #[test]
    fn bot_suffix_is_dropped() {
        assert_eq!(
            parse_command("/setup@echocast_bot"),
            Some(("setup".to_string(), String::new()))
        );
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
    }
}
