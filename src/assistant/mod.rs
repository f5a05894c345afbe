//! One-shot model collaborators
//!
//! Typed text, speech synthesis, grounded search, image generation and
//! transcription all go through the traits here so the session engine can run
//! against fakes. [`GeminiClient`] implements every one of them over REST.

mod gemini;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use gemini::{GeminiClient, GeminiSettings, SseDecoder};

use crate::Result;

/// Stream of text deltas from a streamed reply
pub type TextStream = BoxStream<'static, Result<String>>;

/// A citation attached to an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Link to the source
    pub uri: String,
    /// Human-readable title
    pub title: String,
}

/// Answer text with the sources it was grounded on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcedAnswer {
    /// Answer text
    pub text: String,
    /// Supporting sources, possibly empty
    pub sources: Vec<Source>,
}

/// A generated image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    /// Image location, usually a `data:` URI
    pub uri: String,
    /// Image MIME type
    pub mime_type: String,
}

/// Synthesized speech
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechAudio {
    /// Payload MIME type, e.g. `audio/L16;codec=pcm;rate=24000`
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

/// Answers typed text and voices replies
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Generate a complete reply
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    async fn generate_text(&self, prompt: &str) -> Result<String>;

    /// Generate a reply as a stream of text deltas
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn stream_text(&self, prompt: &str) -> Result<TextStream>;

    /// Synthesize speech for `text`
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio>;
}

/// Executes the model's tools
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Search the web
    ///
    /// # Errors
    ///
    /// Returns error if the search fails
    async fn search_web(&self, query: &str) -> Result<SourcedAnswer>;

    /// Find places matching `query`, optionally near `location`
    ///
    /// # Errors
    ///
    /// Returns error if the search fails
    async fn search_places(&self, query: &str, location: Option<&str>) -> Result<SourcedAnswer>;

    /// Generate an image
    ///
    /// # Errors
    ///
    /// Returns error if generation fails
    async fn generate_image(&self, prompt: &str, aspect_ratio: &str) -> Result<GeneratedImage>;
}

/// Turns recorded speech into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV bytes
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String>;
}
