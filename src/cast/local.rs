//! Local speaker link
//!
//! Plays prepared MP3 files on this machine's default output device, so the
//! bot can run without any cast receiver on the network.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tokio::sync::watch;

use super::{DeviceLink, PlaybackSource, TransportSnapshot, TransportStatus};
use crate::{Error, Result};

/// Decoded mono PCM ready for the output stream
struct DecodedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
}

struct Active {
    stop: Arc<AtomicBool>,
    snapshot_rx: watch::Receiver<TransportSnapshot>,
    task: tokio::task::JoinHandle<()>,
}

/// Link to this machine's speakers
#[derive(Default)]
pub struct LocalPlayerLink {
    active: Option<Active>,
}

impl LocalPlayerLink {
    /// Create a local player link
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn halt_current(&mut self) {
        if let Some(active) = self.active.take() {
            active.stop.store(true, Ordering::Relaxed);
            active.task.abort();
        }
    }
}

#[async_trait]
impl DeviceLink for LocalPlayerLink {
    async fn connect(&mut self) -> Result<()> {
        // Nothing to establish; the output device is opened per playback.
        Ok(())
    }

    async fn play(&mut self, source: &PlaybackSource) -> Result<()> {
        let PlaybackSource::File(path) = source else {
            return Err(Error::Playback(
                "the local player only plays files".to_string(),
            ));
        };
        self.halt_current();

        let bytes = tokio::fs::read(path).await?;
        let decoded = decode_mp3(&bytes)?;
        if decoded.samples.is_empty() {
            return Err(Error::Playback("decoded audio is empty".to_string()));
        }

        let duration_secs = f64::from(decoded.samples.len() as u32) / f64::from(decoded.sample_rate);
        let stop = Arc::new(AtomicBool::new(false));
        let (snapshot_tx, snapshot_rx) = watch::channel(TransportSnapshot {
            status: TransportStatus::Playing,
            finished: false,
            position_secs: 0.0,
            duration_secs,
        });

        let stop_flag = Arc::clone(&stop);
        let task = tokio::task::spawn_blocking(move || {
            if let Err(e) = play_to_speakers(&decoded, &stop_flag, &snapshot_tx) {
                tracing::error!(error = %e, "local playback failed");
                let _ = snapshot_tx.send(TransportSnapshot {
                    status: TransportStatus::Error,
                    ..TransportSnapshot::default()
                });
            }
        });

        self.active = Some(Active {
            stop,
            snapshot_rx,
            task,
        });
        Ok(())
    }

    fn snapshot(&self) -> TransportSnapshot {
        self.active
            .as_ref()
            .map_or_else(TransportSnapshot::default, |a| *a.snapshot_rx.borrow())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(active) = &self.active {
            active.stop.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.halt_current();
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn device_id(&self) -> &str {
        "local"
    }
}

/// Blocking playback on the default output device. Publishes position while
/// running and an idle snapshot when done.
fn play_to_speakers(
    decoded: &DecodedAudio,
    stop: &AtomicBool,
    snapshot_tx: &watch::Sender<TransportSnapshot>,
) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

    let sample_rate = decoded.sample_rate;
    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Playback(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .or_else(|| {
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        })
        .ok_or_else(|| Error::Playback("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = config.channels as usize;

    let samples = Arc::new(decoded.samples.clone());
    let position = Arc::new(AtomicUsize::new(0));

    let callback_samples = Arc::clone(&samples);
    let callback_position = Arc::clone(&position);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = callback_position.load(Ordering::Relaxed);
                for frame in data.chunks_mut(channels) {
                    let sample = callback_samples.get(pos).copied().unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                    if pos < callback_samples.len() {
                        pos += 1;
                    }
                }
                callback_position.store(pos, Ordering::Relaxed);
            },
            |err| {
                tracing::error!(error = %err, "output stream error");
            },
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))?;

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let total = samples.len();
    let duration_secs = f64::from(total as u32) / f64::from(sample_rate);
    let mut interrupted = false;

    loop {
        let pos = position.load(Ordering::Relaxed);
        if pos >= total {
            break;
        }
        if stop.load(Ordering::Relaxed) {
            interrupted = true;
            break;
        }
        let _ = snapshot_tx.send(TransportSnapshot {
            status: TransportStatus::Playing,
            finished: false,
            position_secs: f64::from(pos as u32) / f64::from(sample_rate),
            duration_secs,
        });
        std::thread::sleep(Duration::from_millis(50));
    }

    // Let the last buffer drain before the stream is torn down
    if !interrupted {
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(stream);

    let _ = snapshot_tx.send(TransportSnapshot {
        status: TransportStatus::Idle,
        finished: !interrupted,
        position_secs: if interrupted {
            f64::from(position.load(Ordering::Relaxed) as u32) / f64::from(sample_rate)
        } else {
            duration_secs
        },
        duration_secs,
    });
    tracing::debug!(samples = total, interrupted, "local playback done");
    Ok(())
}

/// Decode MP3 bytes to mono f32 samples at the stream's native rate
fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate == 0 {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or(44_100);
                }
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        (left + right) * 0.5
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("mp3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Playback("no mp3 frames in input".to_string()));
    }
    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_do_not_decode() {
        assert!(decode_mp3(&[0u8; 64]).is_err());
    }

    #[tokio::test]
    async fn rejects_url_sources() {
        let mut link = LocalPlayerLink::new();
        let err = link
            .play(&PlaybackSource::Url {
                url: "http://example.invalid/a.mp3".to_string(),
                content_type: "audio/mpeg".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "playback");
    }

    #[test]
    fn idle_snapshot_before_any_playback() {
        let link = LocalPlayerLink::new();
        assert_eq!(link.snapshot().status, TransportStatus::Idle);
        assert!(link.is_connected());
    }
}
