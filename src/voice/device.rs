//! Audio device seams
//!
//! The session engine only talks to devices through [`AudioBackend`],
//! [`InputDevice`] and [`OutputDevice`]. The cpal implementations run each
//! stream on a dedicated thread since cpal streams are not `Send`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use cpal::traits::StreamTrait;
use tokio::sync::mpsc;

use super::capture::{CpalInput, InputDevice};
use super::playback::{CpalOutput, OutputDevice};
use crate::{Error, Result};

/// Identifier of a scheduled output source
pub type SourceId = u64;

/// Opens input and output devices for a session
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone
    ///
    /// # Errors
    ///
    /// Returns error if no usable input device is available
    fn open_input(&self) -> Result<Box<dyn InputDevice>>;

    /// Acquire the speaker
    ///
    /// `ended` receives the id of every source that finishes playing.
    ///
    /// # Errors
    ///
    /// Returns error if no usable output device is available
    fn open_output(
        &self,
        ended: mpsc::UnboundedSender<SourceId>,
        meter: Arc<LevelMeter>,
    ) -> Result<Arc<dyn OutputDevice>>;
}

/// Default backend using the host's default cpal devices
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(&self) -> Result<Box<dyn InputDevice>> {
        Ok(Box::new(CpalInput::open()?))
    }

    fn open_output(
        &self,
        ended: mpsc::UnboundedSender<SourceId>,
        meter: Arc<LevelMeter>,
    ) -> Result<Arc<dyn OutputDevice>> {
        Ok(Arc::new(CpalOutput::open(ended, meter)?))
    }
}

/// Input and output amplitude levels, written from audio callbacks
///
/// Values are roughly `0.0..=1.0` but not clamped.
#[derive(Debug, Default)]
pub struct LevelMeter {
    input: AtomicU32,
    output: AtomicU32,
}

impl LevelMeter {
    /// Create a meter with both levels at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest microphone level
    #[must_use]
    pub fn input(&self) -> f32 {
        f32::from_bits(self.input.load(Ordering::Relaxed))
    }

    /// Latest speaker level
    #[must_use]
    pub fn output(&self) -> f32 {
        f32::from_bits(self.output.load(Ordering::Relaxed))
    }

    /// Record a microphone level
    pub fn set_input(&self, level: f32) {
        self.input.store(level.to_bits(), Ordering::Relaxed);
    }

    /// Record a speaker level
    pub fn set_output(&self, level: f32) {
        self.output.store(level.to_bits(), Ordering::Relaxed);
    }
}

/// Gain applied to RMS amplitude to get a presentable level
const LEVEL_GAIN: f32 = 5.0;

/// Map a frame RMS onto the presentation level scale
#[must_use]
pub fn normalized_level(rms: f32) -> f32 {
    rms * LEVEL_GAIN
}

/// A cpal stream parked on its own thread until stopped or dropped
pub(crate) struct StreamThread {
    stop: Option<std::sync::mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Build and play a stream on a new thread
    ///
    /// Returns once the stream is playing, or with the build error.
    pub(crate) fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
                    Ok(stream)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Parked until the owner signals or hangs up
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::Audio(format!("{name} thread exited before starting")))
            }
        }
    }

    /// Stop the stream and join its thread
    pub(crate) fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}
