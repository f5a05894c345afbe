//! Voice processing module
//!
//! Handles audio capture and encoding, decoding and gapless playback, and
//! wake word detection while the session sleeps.

mod capture;
mod codec;
mod device;
mod playback;
mod stt;
mod wake_word;

pub use capture::{
    CaptureLoop, CpalInput, DEFAULT_FRAME_SAMPLES, FatalCallback, FrameAssembler, FrameSink,
    InputDevice, SampleCallback, samples_to_wav,
};
pub use codec::{
    AudioChunk, AudioFrameDecoder, EncodedFrame, INPUT_SAMPLE_RATE, MODEL_OUTPUT_SAMPLE_RATE,
    encode_frame, pcm_mime, pcm16_le, rms,
};
pub use device::{AudioBackend, CpalBackend, LevelMeter, SourceId, normalized_level};
pub use playback::{CpalOutput, OutputDevice, PlaybackScheduler, ScheduledSource};
pub use stt::{SpeechToText, SttProvider};
pub use wake_word::{
    RESTART_DELAY, Recognition, Recognizer, RecognizerError, RecognizerFactory, SegmenterState,
    SpeechSegmentRecognizer, SpeechSegmentRecognizerFactory, SpeechSegmenter, WakeEvent,
    WakeMatch, WakeWordDetector, WakeWordListener,
};
