//! Audio playback to speakers
//!
//! [`PlaybackScheduler`] packs decoded chunks back to back on the output
//! device clock and tracks every scheduled source so that "speaking" is true
//! exactly while something is queued or playing.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc;

use super::codec::{AudioChunk, AudioFrameDecoder, MODEL_OUTPUT_SAMPLE_RATE, rms};
use super::device::{LevelMeter, SourceId, StreamThread, normalized_level};
use crate::{Error, Result};

/// A speaker with a monotonic clock that can start sources at a given time
pub trait OutputDevice: Send + Sync {
    /// Output sample rate in Hz
    fn sample_rate(&self) -> u32;

    /// Output channel count
    fn channels(&self) -> u16;

    /// Current device clock in seconds
    fn current_time(&self) -> f64;

    /// Schedule `chunk` to start at `start_at` seconds on the device clock
    ///
    /// # Errors
    ///
    /// Returns error if the device rejects the source
    fn start_source(&self, id: SourceId, chunk: AudioChunk, start_at: f64) -> Result<()>;

    /// Stop a source immediately; unknown ids are ignored
    fn stop_source(&self, id: SourceId);
}

/// A source queued on the cpal mixer
struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
    position: usize,
}

/// Plays scheduled sources on the default output device
pub struct CpalOutput {
    config: StreamConfig,
    clock: Arc<AtomicU64>,
    voices: Arc<Mutex<Vec<Voice>>>,
    _stream: StreamThread,
}

impl CpalOutput {
    /// Open the default output device and start the mixer stream
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open(ended: mpsc::UnboundedSender<SourceId>, meter: Arc<LevelMeter>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(MODEL_OUTPUT_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(MODEL_OUTPUT_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(MODEL_OUTPUT_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(MODEL_OUTPUT_SAMPLE_RATE)
                })
            })
            .map(|c| c.with_sample_rate(SampleRate(MODEL_OUTPUT_SAMPLE_RATE)));

        // Last resort: whatever the device prefers, chunks get resampled
        let config = match supported_config {
            Some(c) => c.config(),
            None => device
                .default_output_config()
                .map_err(|e| Error::Audio(e.to_string()))?
                .config(),
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        let clock = Arc::new(AtomicU64::new(0));
        let voices: Arc<Mutex<Vec<Voice>>> = Arc::new(Mutex::new(Vec::new()));

        let stream = {
            let config = config.clone();
            let clock = Arc::clone(&clock);
            let voices = Arc::clone(&voices);
            StreamThread::spawn("vesper-playback", move || {
                let host = cpal::default_host();
                let device = host
                    .default_output_device()
                    .ok_or_else(|| Error::Audio("no output device".to_string()))?;
                let channels = usize::from(config.channels);

                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            render(data, channels, &clock, &voices, &ended);
                            meter.set_output(normalized_level(rms(data)));
                        },
                        |err| {
                            tracing::error!(error = %err, "audio playback error");
                        },
                        None,
                    )
                    .map_err(|e| Error::Audio(e.to_string()))
            })?
        };

        Ok(Self {
            config,
            clock,
            voices,
            _stream: stream,
        })
    }
}

/// Mix all due voices into `data` and advance the frame clock
fn render(
    data: &mut [f32],
    channels: usize,
    clock: &AtomicU64,
    voices: &Mutex<Vec<Voice>>,
    ended: &mpsc::UnboundedSender<SourceId>,
) {
    data.fill(0.0);
    let base = clock.load(Ordering::Acquire);
    let frames = data.len() / channels.max(1);

    if let Ok(mut voices) = voices.lock() {
        for voice in voices.iter_mut() {
            for (offset, frame) in (0u64..).zip(data.chunks_mut(channels.max(1))) {
                if base + offset < voice.start_frame {
                    continue;
                }
                if voice.position >= voice.samples.len() {
                    break;
                }
                for out in frame.iter_mut() {
                    if let Some(sample) = voice.samples.get(voice.position) {
                        *out += *sample;
                    }
                    voice.position += 1;
                }
            }
        }

        voices.retain(|voice| {
            let finished = voice.position >= voice.samples.len();
            if finished {
                let _ = ended.send(voice.id);
            }
            !finished
        });
    }

    for out in data.iter_mut() {
        *out = out.clamp(-1.0, 1.0);
    }

    clock.store(base + frames as u64, Ordering::Release);
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }

    #[allow(clippy::cast_precision_loss)]
    fn current_time(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / f64::from(self.sample_rate())
    }

    fn start_source(&self, id: SourceId, chunk: AudioChunk, start_at: f64) -> Result<()> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let start_frame = (start_at.max(0.0) * f64::from(self.sample_rate())).round() as u64;

        let mut voices = self
            .voices
            .lock()
            .map_err(|_| Error::Audio("playback mixer poisoned".to_string()))?;
        voices.push(Voice {
            id,
            start_frame,
            samples: chunk.into_samples(),
            position: 0,
        });
        Ok(())
    }

    fn stop_source(&self, id: SourceId) {
        if let Ok(mut voices) = self.voices.lock() {
            voices.retain(|voice| voice.id != id);
        }
    }
}

/// Where and when a chunk was scheduled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    /// Source id reported back on completion
    pub id: SourceId,
    /// Start time on the device clock, in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
}

/// Gapless scheduler with barge-in support
pub struct PlaybackScheduler {
    device: Arc<dyn OutputDevice>,
    cursor: f64,
    active: BTreeSet<SourceId>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    /// Create a scheduler whose cursor starts at the device's current time
    #[must_use]
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        let cursor = device.current_time();
        Self {
            device,
            cursor,
            active: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Decoder producing chunks in this device's format
    #[must_use]
    pub fn decoder(&self) -> AudioFrameDecoder {
        AudioFrameDecoder::new(self.device.sample_rate(), self.device.channels())
    }

    /// Schedule a chunk right after everything already queued
    ///
    /// Returns `None` for empty chunks.
    ///
    /// # Errors
    ///
    /// Returns error if the chunk format does not match the device or the
    /// device rejects the source
    pub fn enqueue(&mut self, chunk: AudioChunk) -> Result<Option<ScheduledSource>> {
        if chunk.is_empty() {
            return Ok(None);
        }
        if chunk.sample_rate() != self.device.sample_rate()
            || chunk.channels() != self.device.channels()
        {
            return Err(Error::Codec(format!(
                "chunk format {} Hz/{}ch does not match device {} Hz/{}ch",
                chunk.sample_rate(),
                chunk.channels(),
                self.device.sample_rate(),
                self.device.channels()
            )));
        }

        let id = self.next_id;
        self.next_id += 1;

        let duration = chunk.duration();
        let start = self.cursor.max(self.device.current_time());
        self.device.start_source(id, chunk, start)?;

        self.cursor = start + duration;
        self.active.insert(id);

        tracing::trace!(id, start, duration, queued = self.active.len(), "chunk scheduled");
        Ok(Some(ScheduledSource {
            id,
            start,
            duration,
        }))
    }

    /// Record that a source finished playing
    ///
    /// Returns `true` when this completion emptied the tracked set.
    pub fn source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id) && self.active.is_empty()
    }

    /// Stop everything immediately and restart the cursor at device time
    ///
    /// Returns the number of sources that were cut off.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active) {
            self.device.stop_source(id);
        }
        self.cursor = self.device.current_time();

        if stopped > 0 {
            tracing::debug!(stopped, "playback interrupted");
        }
        stopped
    }

    /// Whether any source is queued or playing
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    /// Number of tracked sources
    #[must_use]
    pub fn active_sources(&self) -> usize {
        self.active.len()
    }

    /// Next scheduled start time
    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.cursor
    }
}
