//! Gemini REST client

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    Assistant, GeneratedImage, Source, SourcedAnswer, SpeechAudio, TextStream, ToolBackend,
    Transcriber,
};
use crate::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const TRANSCRIBE_PROMPT: &str =
    "Transcribe this audio verbatim. Reply with the transcript only, or nothing if there is no speech.";

/// Models and voice used by [`GeminiClient`]
#[derive(Debug, Clone)]
pub struct GeminiSettings {
    /// REST base URL
    pub base_url: String,
    /// Model for text replies, grounding and transcription
    pub text_model: String,
    /// Model for speech synthesis
    pub tts_model: String,
    /// Model for image generation
    pub image_model: String,
    /// Prebuilt voice name for synthesis
    pub voice: String,
    /// System prompt for text replies
    pub system_instruction: Option<String>,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            text_model: "gemini-2.5-flash".to_string(),
            tts_model: "gemini-2.5-flash-preview-tts".to_string(),
            image_model: "imagen-4.0-generate-001".to_string(),
            voice: "Puck".to_string(),
            system_instruction: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<serde_json::Value>,
}

impl GenerateRequest {
    fn new(parts: Vec<Part>) -> Self {
        Self {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts,
            }],
            system_instruction: None,
            tools: Vec::new(),
            generation_config: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<GroundingRef>,
    #[serde(default)]
    maps: Option<GroundingRef>,
}

#[derive(Debug, Default, Deserialize)]
struct GroundingRef {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

impl GenerateResponse {
    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.candidates
            .iter()
            .take(1)
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
    }

    /// Concatenated text of the first candidate
    fn text(&self) -> String {
        self.parts().filter_map(|p| p.text.as_deref()).collect()
    }

    /// First inline payload of the first candidate
    fn inline_data(&self) -> Option<&InlineData> {
        self.parts().find_map(|p| p.inline_data.as_ref())
    }

    /// Grounding sources of the first candidate, deduplicated by URI
    fn sources(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = Vec::new();
        let chunks = self
            .candidates
            .first()
            .and_then(|c| c.grounding_metadata.as_ref())
            .map(|g| g.grounding_chunks.as_slice())
            .unwrap_or_default();

        for chunk in chunks {
            let Some(reference) = chunk.web.as_ref().or(chunk.maps.as_ref()) else {
                continue;
            };
            let Some(uri) = reference.uri.clone() else {
                continue;
            };
            if sources.iter().any(|s| s.uri == uri) {
                continue;
            }
            let title = reference.title.clone().unwrap_or_else(|| uri.clone());
            sources.push(Source { uri, title });
        }

        sources
    }
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
}

/// Incremental parser for `alt=sse` responses
///
/// Feeds raw body bytes and yields the text of every complete `data:` line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append body bytes and return the text deltas of completed events
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);

            let Some(data) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }

            match serde_json::from_str::<GenerateResponse>(data) {
                Ok(response) => {
                    let text = response.text();
                    if !text.is_empty() {
                        out.push(Ok(text));
                    }
                }
                Err(e) => out.push(Err(e.into())),
            }
        }

        out
    }
}

/// Gemini REST client for one-shot requests
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: SecretString,
    settings: GeminiSettings,
}

impl GeminiClient {
    /// Create a new client
    #[must_use]
    pub fn new(api_key: SecretString, settings: GeminiSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            settings,
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/models/{model}:{method}", self.settings.base_url)
    }

    fn system_instruction(&self) -> Option<Content> {
        self.settings.system_instruction.as_ref().map(|text| Content {
            role: None,
            parts: vec![Part::text(text.clone())],
        })
    }

    async fn post(&self, url: &str, body: &impl Serialize) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Gemini request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Gemini API error");
            return Err(Error::Assistant(format!("Gemini API error {status}: {body}")));
        }

        Ok(response)
    }

    async fn generate(&self, model: &str, request: &GenerateRequest) -> Result<GenerateResponse> {
        let url = self.model_url(model, "generateContent");
        let response = self.post(&url, request).await?;
        Ok(response.json().await?)
    }

    async fn grounded(&self, prompt: String, tool: serde_json::Value) -> Result<SourcedAnswer> {
        let mut request = GenerateRequest::new(vec![Part::text(prompt)]);
        request.tools = vec![tool];

        let response = self.generate(&self.settings.text_model, &request).await?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(Error::Assistant("empty grounded answer".to_string()));
        }

        Ok(SourcedAnswer {
            sources: response.sources(),
            text,
        })
    }
}

#[async_trait]
impl Assistant for GeminiClient {
    async fn generate_text(&self, prompt: &str) -> Result<String> {
        tracing::debug!(chars = prompt.len(), "generating reply");

        let mut request = GenerateRequest::new(vec![Part::text(prompt)]);
        request.system_instruction = self.system_instruction();

        let text = self
            .generate(&self.settings.text_model, &request)
            .await?
            .text();
        if text.trim().is_empty() {
            return Err(Error::Assistant("model returned no text".to_string()));
        }
        Ok(text)
    }

    async fn stream_text(&self, prompt: &str) -> Result<TextStream> {
        tracing::debug!(chars = prompt.len(), "streaming reply");

        let mut request = GenerateRequest::new(vec![Part::text(prompt)]);
        request.system_instruction = self.system_instruction();

        let url = format!(
            "{}?alt=sse",
            self.model_url(&self.settings.text_model, "streamGenerateContent")
        );
        let response = self.post(&url, &request).await?;

        let stream = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let deltas = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(e) => vec![Err(Error::Http(e))],
                };
                futures::future::ready(Some(deltas))
            })
            .flat_map(futures::stream::iter);

        Ok(stream.boxed())
    }

    async fn synthesize(&self, text: &str) -> Result<SpeechAudio> {
        tracing::debug!(chars = text.len(), voice = %self.settings.voice, "synthesizing speech");

        let mut request = GenerateRequest::new(vec![Part::text(text)]);
        request.generation_config = Some(json!({
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": self.settings.voice }
                }
            }
        }));

        let response = self.generate(&self.settings.tts_model, &request).await?;
        let inline = response
            .inline_data()
            .ok_or_else(|| Error::Assistant("TTS response contained no audio".to_string()))?;

        Ok(SpeechAudio {
            mime_type: inline.mime_type.clone(),
            data: inline.data.clone(),
        })
    }
}

#[async_trait]
impl ToolBackend for GeminiClient {
    async fn search_web(&self, query: &str) -> Result<SourcedAnswer> {
        tracing::debug!(query, "grounded web search");
        self.grounded(query.to_string(), json!({ "googleSearch": {} }))
            .await
    }

    async fn search_places(&self, query: &str, location: Option<&str>) -> Result<SourcedAnswer> {
        tracing::debug!(query, location, "grounded places search");
        let prompt = match location {
            Some(location) => format!("{query} near {location}"),
            None => query.to_string(),
        };
        self.grounded(prompt, json!({ "googleMaps": {} })).await
    }

    async fn generate_image(&self, prompt: &str, aspect_ratio: &str) -> Result<GeneratedImage> {
        tracing::debug!(prompt, aspect_ratio, "generating image");

        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": { "sampleCount": 1, "aspectRatio": aspect_ratio }
        });
        let url = self.model_url(&self.settings.image_model, "predict");
        let response: PredictResponse = self.post(&url, &body).await?.json().await?;

        let prediction = response
            .predictions
            .into_iter()
            .next()
            .ok_or_else(|| Error::Assistant("no image returned".to_string()))?;
        let data = prediction
            .bytes_base64_encoded
            .ok_or_else(|| Error::Assistant("image prediction had no data".to_string()))?;
        let mime_type = prediction.mime_type.unwrap_or_else(|| "image/png".to_string());

        Ok(GeneratedImage {
            uri: format!("data:{mime_type};base64,{data}"),
            mime_type,
        })
    }
}

#[async_trait]
impl Transcriber for GeminiClient {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting Gemini transcription");

        let request = GenerateRequest::new(vec![
            Part::text(TRANSCRIBE_PROMPT),
            Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: "audio/wav".to_string(),
                    data: B64.encode(&wav),
                }),
            },
        ]);

        let text = self
            .generate(&self.settings.text_model, &request)
            .await
            .map_err(|e| Error::Stt(e.to_string()))?
            .text();

        tracing::debug!(transcript = %text, "transcription complete");
        Ok(text.trim().to_string())
    }
}
