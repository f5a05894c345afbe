//! Configuration management for Vesper

use std::path::PathBuf;

use secrecy::SecretString;

use crate::assistant::GeminiSettings;
use crate::realtime::SessionSetup;
use crate::session::SessionConfig;
use crate::voice::DEFAULT_FRAME_SAMPLES;
use crate::{Error, Result};

/// Gemini Live endpoint
pub const DEFAULT_REALTIME_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Model used for the duplex session
pub const DEFAULT_REALTIME_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Vesper, a friendly voice assistant. \
Keep answers short and conversational. Use the searchWeb, findNearbyPlaces and \
generateImage tools when they help, and call shutdown when the user says goodbye.";

/// Vesper configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Model API key
    pub api_key: SecretString,

    /// Duplex channel endpoint (`ws://` or `wss://`)
    pub realtime_url: String,

    /// Model for the duplex session
    pub realtime_model: String,

    /// One-shot model settings
    pub gemini: GeminiSettings,

    /// Phrases that wake the session from standby
    pub wake_words: Vec<String>,

    /// Samples per outbound microphone frame
    pub frame_samples: usize,

    /// Stream typed-text replies
    pub stream_replies: bool,

    /// Whisper model used for wake word transcription
    pub stt_model: String,

    /// Optional third-party keys
    pub api_keys: ApiKeys,

    /// Path to `commands.toml`
    pub commands_path: PathBuf,
}

/// API keys for optional services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `Brave` Search API key
    pub brave: Option<SecretString>,

    /// `Serper` API key
    pub serper: Option<SecretString>,

    /// `OpenAI` API key (Whisper wake word transcription)
    pub openai: Option<SecretString>,

    /// `Deepgram` API key (wake word transcription)
    pub deepgram: Option<SecretString>,
}

/// Return the config directory, e.g. `~/.config/vesper` on Linux
#[must_use]
pub fn config_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "vesper", "vesper")
        .map_or_else(|| PathBuf::from(".vesper"), |d| d.config_dir().to_path_buf())
}

impl Config {
    /// Load configuration from the environment
    ///
    /// # Errors
    ///
    /// Returns error if no API key is set or a value is malformed
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Returns error if no API key is set or a value is malformed
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secret = |key: &str| var(key).map(SecretString::from);

        let api_key = secret("VESPER_API_KEY")
            .or_else(|| secret("GEMINI_API_KEY"))
            .ok_or(Error::MissingCredential("VESPER_API_KEY"))?;

        let realtime_url =
            var("VESPER_REALTIME_URL").unwrap_or_else(|| DEFAULT_REALTIME_URL.to_string());
        if !(realtime_url.starts_with("wss://") || realtime_url.starts_with("ws://")) {
            return Err(Error::Config(format!(
                "VESPER_REALTIME_URL must be a ws:// or wss:// URL, got {realtime_url}"
            )));
        }

        let defaults = GeminiSettings::default();
        let gemini = GeminiSettings {
            base_url: var("VESPER_API_BASE_URL").unwrap_or(defaults.base_url),
            text_model: var("VESPER_TEXT_MODEL").unwrap_or(defaults.text_model),
            tts_model: var("VESPER_TTS_MODEL").unwrap_or(defaults.tts_model),
            image_model: var("VESPER_IMAGE_MODEL").unwrap_or(defaults.image_model),
            voice: var("VESPER_VOICE").unwrap_or(defaults.voice),
            system_instruction: Some(
                var("VESPER_SYSTEM_PROMPT")
                    .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            ),
        };

        let wake_words: Vec<String> = var("VESPER_WAKE_WORDS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|w| !w.is_empty())
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_else(|| vec!["hey vesper".to_string(), "vesper".to_string()]);
        if wake_words.is_empty() {
            return Err(Error::Config("VESPER_WAKE_WORDS has no phrases".to_string()));
        }

        let frame_samples = match var("VESPER_FRAME_SAMPLES") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::Config(format!("invalid VESPER_FRAME_SAMPLES: {v}")))?,
            None => DEFAULT_FRAME_SAMPLES,
        };

        let stream_replies = var("VESPER_STREAM_REPLIES")
            .is_none_or(|v| !(v == "0" || v.eq_ignore_ascii_case("false")));

        let api_keys = ApiKeys {
            brave: secret("BRAVE_API_KEY"),
            serper: secret("SERPER_API_KEY"),
            openai: secret("OPENAI_API_KEY"),
            deepgram: secret("DEEPGRAM_API_KEY"),
        };

        let commands_path = var("VESPER_COMMANDS_PATH")
            .map_or_else(|| config_dir().join("commands.toml"), PathBuf::from);

        Ok(Self {
            api_key,
            realtime_url,
            realtime_model: var("VESPER_REALTIME_MODEL")
                .unwrap_or_else(|| DEFAULT_REALTIME_MODEL.to_string()),
            gemini,
            wake_words,
            frame_samples,
            stream_replies,
            stt_model: var("VESPER_STT_MODEL").unwrap_or_else(|| "whisper-1".to_string()),
            api_keys,
            commands_path,
        })
    }

    /// Session tunables derived from this configuration
    #[must_use]
    pub fn session_config(&self, wake_enabled: bool) -> SessionConfig {
        SessionConfig {
            setup: SessionSetup {
                model: self.realtime_model.clone(),
                voice: self.gemini.voice.clone(),
                system_instruction: self.gemini.system_instruction.clone(),
                function_declarations: crate::tools::function_declarations(),
            },
            frame_samples: self.frame_samples,
            stream_replies: self.stream_replies,
            wake_words: self.wake_words.clone(),
            wake_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_missing_key_is_reported() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, Error::MissingCredential("VESPER_API_KEY")));
    }

    #[test]
    fn test_gemini_key_fallback_and_defaults() {
        let config = load(&[("GEMINI_API_KEY", "g-key")]).unwrap();

        assert_eq!(config.api_key.expose_secret(), "g-key");
        assert_eq!(config.realtime_url, DEFAULT_REALTIME_URL);
        assert_eq!(config.frame_samples, DEFAULT_FRAME_SAMPLES);
        assert!(config.stream_replies);
        assert_eq!(config.wake_words, ["hey vesper", "vesper"]);
        assert!(config.api_keys.brave.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("VESPER_API_KEY", "v-key"),
            ("GEMINI_API_KEY", "g-key"),
            ("VESPER_WAKE_WORDS", "Computer, hey computer ,"),
            ("VESPER_FRAME_SAMPLES", "800"),
            ("VESPER_STREAM_REPLIES", "false"),
            ("BRAVE_API_KEY", "b-key"),
        ])
        .unwrap();

        assert_eq!(config.api_key.expose_secret(), "v-key");
        assert_eq!(config.wake_words, ["computer", "hey computer"]);
        assert_eq!(config.frame_samples, 800);
        assert!(!config.stream_replies);
        assert!(config.api_keys.brave.is_some());

        let session = config.session_config(true);
        assert_eq!(session.frame_samples, 800);
        assert!(!session.setup.function_declarations.is_empty());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            load(&[("VESPER_API_KEY", "k"), ("VESPER_FRAME_SAMPLES", "lots")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            load(&[("VESPER_API_KEY", "k"), ("VESPER_REALTIME_URL", "https://example.com")]),
            Err(Error::Config(_))
        ));
    }
}
