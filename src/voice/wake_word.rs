//! Wake word detection
//!
//! Runs only while the session is in standby. A [`Recognizer`] turns
//! microphone audio into transcript strings; [`WakeWordListener`] watches its
//! final results for a configured wake phrase and reports the trailing text as
//! a command. The bundled recognizer uses a hybrid approach: local energy
//! detection to segment speech plus cloud transcription of each segment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::{InputDevice, samples_to_wav};
use super::codec::rms;
use super::device::AudioBackend;
use crate::Result;
use crate::assistant::Transcriber;

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum speech length before a segment counts, in seconds
const MIN_SPEECH_SECS: f32 = 0.3;

/// Trailing silence that ends an utterance, in seconds
const SILENCE_SECS: f32 = 0.5;

/// Delay before a failed recognizer is recreated
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// A transcript produced by a recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognition {
    /// Transcript text
    pub text: String,
    /// Whether the recognizer will not revise this text
    pub is_final: bool,
}

/// Recognizer failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecognizerError {
    /// Microphone or speech access was refused; retrying will not help
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Anything else; the recognizer is recreated after [`RESTART_DELAY`]
    #[error("{0}")]
    Transient(String),
}

/// Streams transcripts of whatever the microphone hears
#[async_trait]
pub trait Recognizer: Send {
    /// Wait for the next result
    ///
    /// `Ok(None)` means the recognizer ended and should be recreated.
    async fn next_result(&mut self) -> std::result::Result<Option<Recognition>, RecognizerError>;
}

/// Creates a fresh recognizer for each listening attempt
pub trait RecognizerFactory: Send + Sync {
    /// Build a recognizer
    ///
    /// # Errors
    ///
    /// Returns [`RecognizerError::PermissionDenied`] when audio cannot be
    /// acquired at all
    fn create(&self) -> std::result::Result<Box<dyn Recognizer>, RecognizerError>;
}

/// A wake phrase found in a transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeMatch {
    /// The configured phrase that matched
    pub phrase: String,
    /// Text following the phrase, empty if none
    pub command: String,
}

/// Emitted by [`WakeWordListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeEvent {
    /// A wake phrase was heard
    Detected(WakeMatch),
    /// The listener gave up for good
    Unavailable {
        /// Why listening is impossible
        reason: String,
    },
}

/// A lowercase word and the byte offset where it ends in the source text
struct Token {
    word: String,
    end: usize,
}

/// Split text into lowercase alphanumeric words, dropping punctuation
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut end = 0;

    for (idx, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            word.extend(ch.to_lowercase());
            end = idx + ch.len_utf8();
        } else if ch == '\'' || ch == '\u{2019}' {
            // apostrophes stay inside the word
        } else if !word.is_empty() {
            tokens.push(Token {
                word: std::mem::take(&mut word),
                end,
            });
        }
    }
    if !word.is_empty() {
        tokens.push(Token { word, end });
    }

    tokens
}

/// Matches wake phrases in transcripts
#[derive(Debug, Clone)]
pub struct WakeWordDetector {
    wake_words: Vec<String>,
    phrases: Vec<Vec<String>>,
}

impl WakeWordDetector {
    /// Create a new wake word detector
    ///
    /// # Arguments
    ///
    /// * `wake_words` - List of wake words to detect (e.g., "hey vesper")
    #[must_use]
    pub fn new(wake_words: Vec<String>) -> Self {
        let (wake_words, phrases): (Vec<String>, Vec<Vec<String>>) = wake_words
            .into_iter()
            .map(|w| w.trim().to_lowercase())
            .map(|w| {
                let words = tokenize(&w).into_iter().map(|t| t.word).collect();
                (w, words)
            })
            .filter(|(_, words): &(String, Vec<String>)| !words.is_empty())
            .unzip();

        tracing::debug!(wake_words = ?wake_words, "wake word detector initialized");

        Self {
            wake_words,
            phrases,
        }
    }

    /// Find the first wake phrase in `transcript`
    ///
    /// Matching ignores case and punctuation. The command is the original
    /// text after the phrase, with leading separators removed.
    #[must_use]
    pub fn detect(&self, transcript: &str) -> Option<WakeMatch> {
        let tokens = tokenize(transcript);

        for (phrase, words) in self.wake_words.iter().zip(&self.phrases) {
            let Some(start) = tokens
                .windows(words.len())
                .position(|window| window.iter().zip(words).all(|(t, w)| t.word == *w))
            else {
                continue;
            };

            let end = tokens[start + words.len() - 1].end;
            let command = extract_command(&transcript[end..]);
            tracing::info!(wake_word = %phrase, transcript, "wake word detected");

            return Some(WakeMatch {
                phrase: phrase.clone(),
                command,
            });
        }

        None
    }

    /// Get the configured wake words
    #[must_use]
    pub fn wake_words(&self) -> &[String] {
        &self.wake_words
    }
}

/// Strip the separators left between a wake phrase and its command
fn extract_command(rest: &str) -> String {
    rest.trim_start_matches(|c: char| {
        c.is_whitespace() || matches!(c, ',' | '.' | '!' | '?' | ':' | ';' | '-')
    })
    .trim_end()
    .to_string()
}

/// Background task watching a recognizer for wake phrases
///
/// The task ends after the first detection or when listening becomes
/// impossible. Dropping the listener aborts it.
pub struct WakeWordListener {
    handle: JoinHandle<()>,
}

impl WakeWordListener {
    /// Start listening
    #[must_use]
    pub fn spawn(
        factory: Arc<dyn RecognizerFactory>,
        detector: WakeWordDetector,
        events: mpsc::UnboundedSender<WakeEvent>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            if let Some(event) = listen(factory.as_ref(), &detector).await {
                let _ = events.send(event);
            }
        });
        Self { handle }
    }

    /// Stop listening
    pub fn stop(&self) {
        self.handle.abort();
    }

    /// Whether the task has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for WakeWordListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn listen(factory: &dyn RecognizerFactory, detector: &WakeWordDetector) -> Option<WakeEvent> {
    loop {
        let mut recognizer = match factory.create() {
            Ok(recognizer) => recognizer,
            Err(RecognizerError::PermissionDenied(reason)) => {
                tracing::warn!(reason = %reason, "wake word listening unavailable");
                return Some(WakeEvent::Unavailable { reason });
            }
            Err(RecognizerError::Transient(e)) => {
                tracing::warn!(error = %e, "failed to start recognizer, retrying");
                tokio::time::sleep(RESTART_DELAY).await;
                continue;
            }
        };

        tracing::debug!("wake word listener started");

        loop {
            match recognizer.next_result().await {
                Ok(Some(result)) if result.is_final => {
                    tracing::trace!(text = %result.text, "recognized");
                    if let Some(found) = detector.detect(&result.text) {
                        return Some(WakeEvent::Detected(found));
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!("recognizer ended, restarting");
                    break;
                }
                Err(RecognizerError::PermissionDenied(reason)) => {
                    tracing::warn!(reason = %reason, "wake word listening unavailable");
                    return Some(WakeEvent::Unavailable { reason });
                }
                Err(RecognizerError::Transient(e)) => {
                    tracing::warn!(error = %e, "recognizer failed, restarting");
                    break;
                }
            }
        }

        drop(recognizer);
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

/// State of the speech segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// Waiting for speech
    Idle,
    /// Detected potential speech, accumulating
    Listening,
}

/// Cuts a sample stream into utterances using an energy threshold
pub struct SpeechSegmenter {
    state: SegmenterState,
    speech_buffer: Vec<f32>,
    speech_counter: usize,
    silence_counter: usize,
    min_speech_samples: usize,
    silence_samples: usize,
}

impl SpeechSegmenter {
    /// Create a segmenter for audio at `sample_rate`
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn new(sample_rate: u32) -> Self {
        let rate = sample_rate as f32;
        Self {
            state: SegmenterState::Idle,
            speech_buffer: Vec::new(),
            speech_counter: 0,
            silence_counter: 0,
            min_speech_samples: (rate * MIN_SPEECH_SECS) as usize,
            silence_samples: (rate * SILENCE_SECS) as usize,
        }
    }

    /// Process audio samples
    ///
    /// Returns the buffered utterance once enough speech has been followed
    /// by enough silence.
    pub fn push(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        let energy = rms(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    self.state = SegmenterState::Listening;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(samples);
                    self.speech_counter = samples.len();
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
            }
            SegmenterState::Listening => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.speech_counter += samples.len();
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                // Enough speech followed by silence
                if self.silence_counter > self.silence_samples
                    && self.speech_counter > self.min_speech_samples
                {
                    tracing::debug!(samples = self.speech_buffer.len(), "speech segment complete");
                    let segment = std::mem::take(&mut self.speech_buffer);
                    self.reset();
                    return Some(segment);
                }

                // Timeout: too much silence without enough speech
                if self.silence_counter > self.silence_samples * 2 {
                    tracing::trace!("timeout - resetting");
                    self.reset();
                }
            }
        }

        None
    }

    /// Reset segmenter to idle state
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.speech_buffer.clear();
        self.speech_counter = 0;
        self.silence_counter = 0;
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> SegmenterState {
        self.state
    }
}

/// Recognizer that segments microphone audio and transcribes each segment
pub struct SpeechSegmentRecognizer {
    device: Box<dyn InputDevice>,
    samples: mpsc::UnboundedReceiver<Vec<f32>>,
    segmenter: SpeechSegmenter,
    transcriber: Arc<dyn Transcriber>,
    sample_rate: u32,
}

impl SpeechSegmentRecognizer {
    /// Start capturing from `device`
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot start
    pub fn start(mut device: Box<dyn InputDevice>, transcriber: Arc<dyn Transcriber>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        device.start(Box::new(move |samples: &[f32]| {
            let _ = tx.send(samples.to_vec());
        }))?;

        let sample_rate = device.sample_rate();
        Ok(Self {
            device,
            samples: rx,
            segmenter: SpeechSegmenter::new(sample_rate),
            transcriber,
            sample_rate,
        })
    }
}

impl Drop for SpeechSegmentRecognizer {
    fn drop(&mut self) {
        self.device.stop();
    }
}

#[async_trait]
impl Recognizer for SpeechSegmentRecognizer {
    async fn next_result(&mut self) -> std::result::Result<Option<Recognition>, RecognizerError> {
        loop {
            let Some(samples) = self.samples.recv().await else {
                return Ok(None);
            };
            if !self.device.is_alive() {
                return Err(RecognizerError::Transient("microphone stream failed".to_string()));
            }

            let Some(segment) = self.segmenter.push(&samples) else {
                continue;
            };

            let wav = samples_to_wav(&segment, self.sample_rate)
                .map_err(|e| RecognizerError::Transient(e.to_string()))?;
            let text = self
                .transcriber
                .transcribe(wav)
                .await
                .map_err(|e| RecognizerError::Transient(e.to_string()))?;

            if text.trim().is_empty() {
                continue;
            }
            return Ok(Some(Recognition {
                text,
                is_final: true,
            }));
        }
    }
}

/// Builds [`SpeechSegmentRecognizer`]s on the given audio backend
pub struct SpeechSegmentRecognizerFactory {
    backend: Arc<dyn AudioBackend>,
    transcriber: Arc<dyn Transcriber>,
}

impl SpeechSegmentRecognizerFactory {
    /// Create a factory
    #[must_use]
    pub fn new(backend: Arc<dyn AudioBackend>, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            backend,
            transcriber,
        }
    }
}

impl RecognizerFactory for SpeechSegmentRecognizerFactory {
    fn create(&self) -> std::result::Result<Box<dyn Recognizer>, RecognizerError> {
        // No microphone at all is treated like a refusal
        let device = self
            .backend
            .open_input()
            .map_err(|e| RecognizerError::PermissionDenied(e.to_string()))?;

        let recognizer = SpeechSegmentRecognizer::start(device, Arc::clone(&self.transcriber))
            .map_err(|e| RecognizerError::Transient(e.to_string()))?;
        Ok(Box::new(recognizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> WakeWordDetector {
        WakeWordDetector::new(vec!["hey vesper".to_string(), "vesper".to_string()])
    }

    #[test]
    fn test_wake_word_detection() {
        let detector = detector();

        assert!(detector.detect("hello world").is_none());

        let found = detector.detect("Hey Vesper, what's the weather?").unwrap();
        assert_eq!(found.phrase, "hey vesper");
        assert_eq!(found.command, "what's the weather?");
    }

    #[test]
    fn test_wake_phrase_alone_has_empty_command() {
        let found = detector().detect("Hey, Vesper!").unwrap();
        assert_eq!(found.phrase, "hey vesper");
        assert_eq!(found.command, "");
    }

    #[test]
    fn test_wake_word_needs_whole_words() {
        let detector = WakeWordDetector::new(vec!["vesper".to_string()]);
        assert!(detector.detect("vespertine skies").is_none());
        assert_eq!(detector.detect("ok Vesper. shut down").unwrap().command, "shut down");
    }

    #[test]
    fn test_blank_wake_words_are_ignored() {
        let detector = WakeWordDetector::new(vec!["  ".to_string(), "Hey Vesper ".to_string()]);
        assert_eq!(detector.wake_words(), ["hey vesper"]);
    }

    #[test]
    fn test_segmenter_emits_after_trailing_silence() {
        let mut segmenter = SpeechSegmenter::new(16_000);
        let speech = vec![0.2f32; 1600];
        let silence = vec![0.0f32; 1600];

        for _ in 0..5 {
            assert!(segmenter.push(&speech).is_none());
        }
        assert_eq!(segmenter.state(), SegmenterState::Listening);

        let mut segment = None;
        for _ in 0..10 {
            if let Some(s) = segmenter.push(&silence) {
                segment = Some(s);
                break;
            }
        }

        let segment = segment.unwrap();
        assert!(segment.len() > 8000);
        assert_eq!(segmenter.state(), SegmenterState::Idle);
    }

    #[test]
    fn test_segmenter_drops_short_blips() {
        let mut segmenter = SpeechSegmenter::new(16_000);
        assert!(segmenter.push(&[0.2f32; 160]).is_none());
        for _ in 0..20 {
            assert!(segmenter.push(&[0.0f32; 1600]).is_none());
        }
        assert_eq!(segmenter.state(), SegmenterState::Idle);
    }
}
