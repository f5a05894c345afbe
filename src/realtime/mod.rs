//! Duplex channel to the remote speech model
//!
//! A [`Connector`] opens a [`DuplexChannel`]: a [`ChannelSender`] for
//! microphone frames and tool results, and a receiver of decoded
//! [`ChannelEvent`]s. The bundled connector speaks the Gemini Live protocol
//! over a WebSocket.

mod protocol;
mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

pub use protocol::{ServerDecoder, SessionSetup};
pub use websocket::WebSocketConnector;

use crate::Result;
use crate::voice::{EncodedFrame, FrameSink};

/// Default capacity of the outbound queue, in messages
pub const OUTBOUND_CAPACITY: usize = 64;

/// Default capacity of the inbound event queue
pub const INBOUND_CAPACITY: usize = 256;

/// Who a transcript belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The person talking into the microphone
    User,
    /// The remote model
    Agent,
}

/// A function call issued by the remote model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolCall {
    /// Correlation id echoed in the result
    pub id: String,
    /// Function name
    pub name: String,
    /// Raw JSON arguments
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Response to a [`PendingToolCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the call being answered
    pub id: String,
    /// Function name of the call being answered
    pub name: String,
    /// JSON payload returned to the model
    pub payload: serde_json::Value,
}

/// Everything the remote side can tell the session
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Session setup acknowledged
    Ready,
    /// Cumulative transcript of the current turn for one speaker
    PartialTranscript {
        /// Whose speech this is
        speaker: Speaker,
        /// Full text of the turn so far
        text: String,
    },
    /// A chunk of synthesized speech
    Audio {
        /// Payload MIME type, e.g. `audio/pcm;rate=24000`
        mime_type: String,
        /// Base64 payload
        data: String,
    },
    /// The model finished its turn
    TurnComplete,
    /// The user barged in; queued speech must be dropped
    Interrupted,
    /// The model wants a tool run
    ToolCall(PendingToolCall),
    /// Transport or protocol failure
    Error(String),
    /// The remote side closed the channel
    Closed {
        /// Close reason, if one was given
        reason: Option<String>,
    },
}

/// Messages queued for the remote side
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Microphone frame
    Audio(EncodedFrame),
    /// Tool call response
    ToolResult(ToolResult),
}

/// Cloneable sending half of a duplex channel
///
/// Never blocks: audio frames are dropped when the queue is full and
/// everything is dropped once the channel is closed.
#[derive(Clone)]
pub struct ChannelSender {
    outbound: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<watch::Sender<bool>>,
}

/// Receiving half of the outbound queue, owned by the transport
pub struct OutboundReceiver {
    /// Queued messages in send order
    pub messages: mpsc::Receiver<Outbound>,
    /// Flips to `true` when the session closes the channel
    pub closed: watch::Receiver<bool>,
}

/// Create a connected sender/receiver pair for an outbound queue
#[must_use]
pub fn outbound_channel(capacity: usize) -> (ChannelSender, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let (close_tx, close_rx) = watch::channel(false);

    (
        ChannelSender {
            outbound: tx,
            closed: Arc::new(AtomicBool::new(false)),
            close_signal: Arc::new(close_tx),
        },
        OutboundReceiver {
            messages: rx,
            closed: close_rx,
        },
    )
}

impl ChannelSender {
    /// Queue a microphone frame; returns `false` if it was dropped
    pub fn send_audio(&self, frame: EncodedFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.try_send(Outbound::Audio(frame)).is_ok()
    }

    /// Queue a tool result
    ///
    /// A full queue defers the send to a background task instead of dropping
    /// the result. Returns `false` only if the channel is closed.
    pub fn send_tool_result(&self, result: ToolResult) -> bool {
        if self.is_closed() {
            return false;
        }

        match self.outbound.try_send(Outbound::ToolResult(result)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::debug!("outbound queue full, deferring tool result");
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let _ = outbound.send(message).await;
                });
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the channel; calling again is a no-op
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.send_replace(true);
            tracing::debug!("duplex channel closed");
        }
    }

    /// Whether [`close`](Self::close) was called or the transport went away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }
}

impl FrameSink for ChannelSender {
    fn send_frame(&self, frame: EncodedFrame) -> bool {
        self.send_audio(frame)
    }
}

/// An open session with the remote model
pub struct DuplexChannel {
    /// Sending half
    pub sender: ChannelSender,
    /// Inbound events in arrival order
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Opens duplex channels
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and send the session setup
    ///
    /// # Errors
    ///
    /// Returns error if the channel cannot be opened
    async fn connect(&self, setup: SessionSetup) -> Result<DuplexChannel>;
}
