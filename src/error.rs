//! Error types for the Vesper voice engine

use thiserror::Error;

/// Result type alias for Vesper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Required credential is not set
    #[error("missing credential: set {0}")]
    MissingCredential(&'static str),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// PCM encoding or decoding error
    #[error("codec error: {0}")]
    Codec(String),

    /// Duplex channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// One-shot model request error
    #[error("assistant error: {0}")]
    Assistant(String),

    /// Tool handler error
    #[error("tool error: {0}")]
    Tool(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Session controller is gone or rejected the request
    #[error("session error: {0}")]
    Session(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
