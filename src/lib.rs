//! echocast - relay chat messages to your speakers
//!
//! A Telegram bot that turns text and voice messages into audio played on
//! Google Cast receivers or this machine's speakers. Text goes through TTS,
//! voice notes are transcoded, and cast receivers fetch the result from a
//! transient HTTP server.

pub mod cast;
pub mod channels;
pub mod config;
pub mod daemon;
pub mod device;
pub mod discovery;
pub mod error;
pub mod orchestrator;
pub mod server;
pub mod tts;

pub use config::Config;
pub use daemon::Daemon;
pub use device::{Device, DeviceType};
pub use error::{Error, Result};
