//! Audio capture from microphone
//!
//! [`CaptureLoop`] turns device callbacks into fixed-size PCM frames, meters
//! their level and pushes them to the outbound channel without ever blocking
//! the device thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleRate, StreamConfig};

use super::codec::{EncodedFrame, INPUT_SAMPLE_RATE, encode_frame, rms};
use super::device::{AudioBackend, LevelMeter, StreamThread, normalized_level};
use crate::{Error, Result};

/// Samples per outbound frame (100ms at 16kHz)
pub const DEFAULT_FRAME_SAMPLES: usize = 1600;

/// Callback receiving raw mono samples from the device thread
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Callback invoked once when the capture loop hits a fatal error
pub type FatalCallback = Box<dyn Fn(Error) + Send + 'static>;

/// A microphone that delivers mono `f32` samples
pub trait InputDevice: Send {
    /// Native sample rate of delivered samples
    fn sample_rate(&self) -> u32;

    /// Start delivering samples to `on_samples`
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be started
    fn start(&mut self, on_samples: SampleCallback) -> Result<()>;

    /// Stop delivering samples; safe to call when already stopped
    fn stop(&mut self);

    /// Whether a stream is currently running
    fn is_capturing(&self) -> bool;

    /// Whether the handle can be reused for another stream
    fn is_alive(&self) -> bool;
}

/// Destination for encoded frames
///
/// Implementations must not block; returning `false` drops the frame.
pub trait FrameSink: Send + Sync {
    /// Offer a frame to the outbound queue
    fn send_frame(&self, frame: EncodedFrame) -> bool;
}

/// Captures audio from the default input device
pub struct CpalInput {
    config: StreamConfig,
    stream: Option<StreamThread>,
    failed: Arc<AtomicBool>,
}

impl CpalInput {
    /// Open the default input device at 16kHz mono
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(INPUT_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(INPUT_SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(INPUT_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = INPUT_SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            config,
            stream: None,
            failed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn start(&mut self, mut on_samples: SampleCallback) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        self.failed.store(false, Ordering::Relaxed);
        let failed = Arc::clone(&self.failed);
        let config = self.config.clone();

        let stream = StreamThread::spawn("vesper-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| Error::Audio("no input device".to_string()))?;

            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| on_samples(data),
                    move |err| {
                        tracing::error!(error = %err, "audio capture error");
                        failed.store(true, Ordering::Relaxed);
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))
        })?;

        self.stream = Some(stream);
        tracing::debug!("audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    fn is_alive(&self) -> bool {
        !self.failed.load(Ordering::Relaxed)
    }
}

/// Splits an arbitrary stream of samples into fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    /// Create an assembler emitting frames of `frame_samples` samples
    #[must_use]
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples from a device callback
    pub fn extend(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    /// Take the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.pending.len() < self.frame_samples {
            return None;
        }
        Some(self.pending.drain(..self.frame_samples).collect())
    }

    /// Number of buffered samples not yet forming a frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Owns the input device for a session and feeds the outbound channel
pub struct CaptureLoop {
    device: Option<Box<dyn InputDevice>>,
    frame_samples: usize,
    meter: Arc<LevelMeter>,
}

impl CaptureLoop {
    /// Create a capture loop; the device is acquired on first start
    #[must_use]
    pub fn new(frame_samples: usize, meter: Arc<LevelMeter>) -> Self {
        Self {
            device: None,
            frame_samples,
            meter,
        }
    }

    /// Start streaming frames into `sink`
    ///
    /// A still-live device handle from a previous session is reused.
    /// `on_fatal` fires at most once, after which the loop drops all audio.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be acquired or started
    pub fn start(
        &mut self,
        backend: &dyn AudioBackend,
        sink: Arc<dyn FrameSink>,
        on_fatal: FatalCallback,
    ) -> Result<()> {
        if self.is_capturing() {
            return Ok(());
        }

        let reusable = self.device.as_ref().is_some_and(|d| d.is_alive());
        if reusable {
            tracing::debug!("reusing input device");
        } else {
            self.device = Some(backend.open_input()?);
            tracing::debug!("input device acquired");
        }

        let Some(device) = self.device.as_mut() else {
            return Err(Error::Audio("input device unavailable".to_string()));
        };

        let sample_rate = device.sample_rate();
        let mut assembler = FrameAssembler::new(self.frame_samples);
        let meter = Arc::clone(&self.meter);
        let mut failed = false;

        let callback: SampleCallback = Box::new(move |data: &[f32]| {
            if failed {
                return;
            }
            assembler.extend(data);

            while let Some(frame) = assembler.next_frame() {
                meter.set_input(normalized_level(rms(&frame)));

                match encode_frame(&frame, sample_rate) {
                    Ok(encoded) => {
                        if !sink.send_frame(encoded) {
                            tracing::trace!("outbound frame dropped");
                        }
                    }
                    Err(e) => {
                        failed = true;
                        on_fatal(e);
                        return;
                    }
                }
            }
        });

        if let Err(e) = device.start(callback) {
            // A device that refuses to start is not worth keeping
            self.device = None;
            return Err(e);
        }

        tracing::info!(sample_rate, frame_samples = self.frame_samples, "capture loop started");
        Ok(())
    }

    /// Stop streaming, keeping the device handle for the next session
    pub fn stop(&mut self) {
        if let Some(device) = self.device.as_mut() {
            if device.is_capturing() {
                device.stop();
                tracing::info!("capture loop stopped");
            }
        }
        self.meter.set_input(0.0);
    }

    /// Stop streaming and drop the device handle
    pub fn release(&mut self) {
        self.stop();
        self.device = None;
    }

    /// Whether frames are currently flowing
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.is_capturing())
    }

    /// Whether a device handle is held
    #[must_use]
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
