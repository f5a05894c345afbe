//! Vesper - Real-time voice agent engine
//!
//! This library provides the core of a conversational voice assistant:
//! - Duplex model sessions over WebSocket (Gemini Live)
//! - Microphone capture and gapless, interruptible playback
//! - Incremental transcription of both directions
//! - Tool calls (web search, nearby places, image generation)
//! - Locally intercepted commands and wake word standby
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Presentation                        │
//! │        watch<SessionSnapshot>  │  levels()           │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               SessionController                      │
//! │  Capture │ Playback │ Transcripts │ Tools │ Wake    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Remote model (duplex + one-shot)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod assistant;
pub mod config;
pub mod error;
pub mod realtime;
pub mod session;
pub mod tools;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{SessionConfig, SessionHandle, SessionServices, SessionSnapshot, SessionState};
