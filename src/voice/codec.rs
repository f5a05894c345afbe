//! PCM wire codec
//!
//! Outbound frames are 16-bit little-endian mono PCM wrapped in base64.
//! Inbound payloads are decoded into interleaved `f32` buffers in the output
//! device's format (sample rate and channel count).

use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use serde::Serialize;

use crate::{Error, Result};

/// Sample rate of outbound microphone audio (16kHz for speech)
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate the remote model streams synthetic speech at
pub const MODEL_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// A decoded, immutable buffer of interleaved samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioChunk {
    /// Create a chunk from interleaved samples
    ///
    /// # Errors
    ///
    /// Returns error if the format is degenerate or the sample count is not a
    /// whole number of frames
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(Error::Codec(format!(
                "invalid audio format: {sample_rate} Hz, {channels} channels"
            )));
        }
        if samples.len() % usize::from(channels) != 0 {
            return Err(Error::Codec(format!(
                "{} samples is not a whole number of {channels}-channel frames",
                samples.len()
            )));
        }

        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Interleaved samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Consume the chunk, returning its samples
    #[must_use]
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// Playback duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Whether the chunk holds no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A PCM frame ready for the outbound channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedFrame {
    /// MIME type including the sample rate (e.g. `audio/pcm;rate=16000`)
    pub mime_type: String,
    /// Base64 of the little-endian 16-bit samples
    pub data: String,
}

/// Encode mono `f32` samples into an outbound PCM frame
///
/// # Errors
///
/// Returns error if any sample is NaN or infinite
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> Result<EncodedFrame> {
    if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
        return Err(Error::Codec(format!("non-finite sample at index {index}")));
    }

    Ok(EncodedFrame {
        mime_type: pcm_mime(sample_rate),
        data: B64.encode(pcm16_le(samples)),
    })
}

/// Convert `f32` samples in `[-1.0, 1.0]` to little-endian 16-bit PCM bytes
#[must_use]
pub fn pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&sample_i16.to_le_bytes());
    }
    bytes
}

/// MIME type for raw PCM at the given rate
#[must_use]
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Root-mean-square amplitude of a block of samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Inbound payload encodings the decoder understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadFormat {
    /// Signed 16-bit little-endian mono PCM
    Pcm16 { sample_rate: u32 },
    /// MPEG layer III
    Mpeg,
}

/// Decodes inbound audio payloads into chunks playable on the output device
#[derive(Debug, Clone, Copy)]
pub struct AudioFrameDecoder {
    target_rate: u32,
    target_channels: u16,
}

impl AudioFrameDecoder {
    /// Create a decoder producing audio at the given device format
    #[must_use]
    pub const fn new(target_rate: u32, target_channels: u16) -> Self {
        Self {
            target_rate,
            target_channels,
        }
    }

    /// Target sample rate
    #[must_use]
    pub const fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Target channel count
    #[must_use]
    pub const fn target_channels(&self) -> u16 {
        self.target_channels
    }

    /// Decode a base64 payload
    ///
    /// # Errors
    ///
    /// Returns error if the base64 or the audio payload is malformed
    pub fn decode_base64(&self, mime_type: &str, data: &str) -> Result<AudioChunk> {
        let bytes = B64
            .decode(data)
            .map_err(|e| Error::Codec(format!("invalid base64 audio: {e}")))?;
        self.decode(mime_type, &bytes)
    }

    /// Decode a binary payload
    ///
    /// # Errors
    ///
    /// Returns error if the MIME type is unsupported or the payload is malformed
    pub fn decode(&self, mime_type: &str, bytes: &[u8]) -> Result<AudioChunk> {
        let (mono, source_rate) = match parse_mime(mime_type)? {
            PayloadFormat::Pcm16 { sample_rate } => (pcm16_to_f32(bytes)?, sample_rate),
            PayloadFormat::Mpeg => decode_mp3(bytes)?,
        };

        let resampled = resample(&mono, source_rate, self.target_rate)?;
        let interleaved = upmix(resampled, self.target_channels);

        AudioChunk::new(interleaved, self.target_rate, self.target_channels)
    }
}

/// Parse an audio MIME type such as `audio/L16;codec=pcm;rate=24000`
fn parse_mime(mime_type: &str) -> Result<PayloadFormat> {
    let lower = mime_type.to_ascii_lowercase();
    let mut parts = lower.split(';').map(str::trim);
    let essence = parts.next().unwrap_or_default();

    match essence {
        "audio/pcm" | "audio/l16" => {
            let sample_rate = parts
                .filter_map(|p| p.strip_prefix("rate="))
                .find_map(|r| r.parse::<u32>().ok())
                .unwrap_or(MODEL_OUTPUT_SAMPLE_RATE);
            if sample_rate == 0 {
                return Err(Error::Codec(format!("invalid sample rate in {mime_type}")));
            }
            Ok(PayloadFormat::Pcm16 { sample_rate })
        }
        "audio/mpeg" | "audio/mp3" => Ok(PayloadFormat::Mpeg),
        _ => Err(Error::Codec(format!("unsupported audio type: {mime_type}"))),
    }
}

/// Convert little-endian 16-bit PCM bytes into `f32` samples
fn pcm16_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Codec(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect())
}

/// Decode MP3 bytes to mono `f32` samples and their sample rate
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = MODEL_OUTPUT_SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if let Ok(rate) = u32::try_from(frame.sample_rate) {
                    sample_rate = rate;
                }
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|pair| {
                        let left = f32::from(pair[0]) / 32768.0;
                        let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Codec(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate))
}

/// Resample a mono buffer between rates
fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FastFixedIn::<f32>::new(
        f64::from(to) / f64::from(from),
        1.0,
        PolynomialDegree::Cubic,
        samples.len(),
        1,
    )
    .map_err(|e| Error::Codec(format!("failed to create resampler: {e}")))?;

    let output = resampler
        .process(&[samples], None)
        .map_err(|e| Error::Codec(format!("resampling failed: {e}")))?;

    Ok(output.into_iter().next().unwrap_or_default())
}

/// Duplicate a mono buffer across `channels` interleaved channels
fn upmix(mono: Vec<f32>, channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return mono;
    }

    let channels = usize::from(channels);
    let mut out = Vec::with_capacity(mono.len() * channels);
    for sample in mono {
        out.extend(std::iter::repeat_n(sample, channels));
    }
    out
}
