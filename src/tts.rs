//! Text-to-speech and audio preparation
//!
//! Speech goes through the macOS `say` engine into AIFF, then through
//! `ffmpeg` into MP3 (cast receivers reject AIFF). Incoming Telegram voice
//! notes arrive as OGG/Opus and get the same MP3 treatment.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Timelike;

use crate::config::TtsConfig;
use crate::{Error, Result};

/// Anything smaller is a failed render, not audio
const MIN_AUDIO_BYTES: u64 = 100;

/// Renders text into a playable MP3 file
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into an MP3 at `output`
    async fn synthesize(&self, text: &str, output: &Path) -> Result<()>;
}

/// `say`-backed synthesizer with `ffmpeg` transcoding
pub struct SaySynthesizer {
    config: TtsConfig,
}

impl SaySynthesizer {
    /// Create a synthesizer with the given voice settings
    #[must_use]
    pub fn new(config: TtsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SpeechSynthesizer for SaySynthesizer {
    async fn synthesize(&self, text: &str, output: &Path) -> Result<()> {
        let aiff = output.with_extension("aiff");
        let outcome = self.render(text, &aiff, output).await;
        // The AIFF intermediate is noise whatever happened
        let _ = tokio::fs::remove_file(&aiff).await;
        outcome
    }
}

impl SaySynthesizer {
    async fn render(&self, text: &str, aiff: &Path, output: &Path) -> Result<()> {
        tracing::info!(
            voice = %self.config.voice,
            chars = text.chars().count(),
            "synthesizing speech"
        );

        let say = tokio::process::Command::new(&self.config.say_path)
            .arg("-v")
            .arg(&self.config.voice)
            .arg("-r")
            .arg(self.config.rate.to_string())
            .arg("-o")
            .arg(aiff)
            .arg(text)
            .output()
            .await
            .map_err(|e| Error::Prep(format!("cannot run {}: {e}", self.config.say_path)))?;
        if !say.status.success() {
            return Err(Error::Prep(format!(
                "say failed: {}",
                String::from_utf8_lossy(&say.stderr).trim()
            )));
        }
        if !aiff.exists() {
            return Err(Error::Prep("say produced no audio".to_string()));
        }

        let ffmpeg = tokio::process::Command::new(&self.config.ffmpeg_path)
            .arg("-y")
            .arg("-i")
            .arg(aiff)
            .arg("-acodec")
            .arg("libmp3lame")
            .arg("-b:a")
            .arg("128k")
            .arg(output)
            .output()
            .await
            .map_err(|e| Error::Prep(format!("cannot run {}: {e}", self.config.ffmpeg_path)))?;
        if !ffmpeg.status.success() {
            return Err(Error::Prep(format!(
                "ffmpeg failed: {}",
                String::from_utf8_lossy(&ffmpeg.stderr).trim()
            )));
        }

        let size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if size < MIN_AUDIO_BYTES {
            return Err(Error::Prep(format!("rendered mp3 too small ({size} bytes)")));
        }
        tracing::debug!(bytes = size, "speech rendered");
        Ok(())
    }
}

/// Transcode a downloaded voice note (OGG/Opus) to MP3 for receivers that
/// refuse OGG. If `ffmpeg` is missing or fails, the original file is used
/// as-is; some receivers play it anyway.
pub async fn normalize_voice_message(ffmpeg_path: &str, ogg: &Path) -> PathBuf {
    let mp3 = ogg.with_extension("mp3");
    let result = tokio::process::Command::new(ffmpeg_path)
        .arg("-y")
        .arg("-i")
        .arg(ogg)
        .arg("-acodec")
        .arg("libmp3lame")
        .arg(&mp3)
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => mp3,
        Ok(output) => {
            tracing::error!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "voice note transcode failed, playing original"
            );
            ogg.to_path_buf()
        }
        Err(e) => {
            tracing::warn!(error = %e, "ffmpeg unavailable, playing original voice note");
            ogg.to_path_buf()
        }
    }
}

/// Expand message variables before synthesis. `$TIME` becomes the current
/// time spoken in Chinese.
#[must_use]
pub fn expand_variables(text: &str) -> String {
    if text.contains("$TIME") {
        let now = chrono::Local::now();
        text.replace("$TIME", &chinese_time_phrase(now.hour(), now.minute()))
    } else {
        text.to_string()
    }
}

/// Render a clock time as a Chinese phrase, e.g. 09:00 becomes
/// 現在時間是早上9點整.
fn chinese_time_phrase(hour: u32, minute: u32) -> String {
    let period = match hour {
        5..=11 => "早上",
        12 => "中午",
        13..=17 => "下午",
        18..=21 => "晚上",
        _ => "深夜",
    };

    let mut display_hour = if hour > 12 { hour - 12 } else { hour };
    if display_hour == 0 {
        display_hour = 12;
    }

    if minute == 0 {
        format!("現在時間是{period}{display_hour}點整")
    } else {
        format!("現在時間是{period}{display_hour}點{minute}分")
    }
}
