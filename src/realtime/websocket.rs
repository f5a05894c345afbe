//! WebSocket transport for the duplex channel

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use url::Url;

use super::protocol::{ClientMessage, ServerDecoder, SessionSetup};
use super::{
    ChannelEvent, Connector, DuplexChannel, INBOUND_CAPACITY, OUTBOUND_CAPACITY, OutboundReceiver,
    outbound_channel,
};
use crate::{Error, Result};

/// How long the server gets to acknowledge `setup`
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to a Gemini Live endpoint
///
/// The channel is handed over only after the server acknowledged the setup
/// message, so nothing is streamed before the model is ready.
pub struct WebSocketConnector {
    endpoint: Url,
    api_key: SecretString,
}

impl WebSocketConnector {
    /// Create a connector for `endpoint`, authenticating with `api_key`
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is not a `ws://` or `wss://` URL
    pub fn new(endpoint: &str, api_key: SecretString) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| Error::Config(format!("invalid realtime URL: {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "realtime URL must use ws or wss, got {}",
                endpoint.scheme()
            )));
        }

        Ok(Self { endpoint, api_key })
    }

    fn authenticated_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", self.api_key.expose_secret());
        url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, setup: SessionSetup) -> Result<DuplexChannel> {
        tracing::info!(
            host = self.endpoint.host_str().unwrap_or_default(),
            model = %setup.model,
            "connecting to realtime endpoint"
        );

        let url = self.authenticated_url();
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::Channel(format!("connect failed: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(ClientMessage::setup(&setup).to_json()?))
            .await?;

        let mut decoder = ServerDecoder::new();
        let early = tokio::time::timeout(SETUP_TIMEOUT, await_setup(&mut stream, &mut decoder))
            .await
            .map_err(|_| Error::Channel("timed out waiting for setup to complete".to_string()))??;
        tracing::debug!("setup acknowledged");

        let (sender, outbound) = outbound_channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(INBOUND_CAPACITY);

        tokio::spawn(write_loop(sink, outbound));

        tokio::spawn(async move {
            for event in early {
                if events_tx.send(event).await.is_err() {
                    return;
                }
            }

            loop {
                let events = match stream.next().await {
                    Some(Ok(Message::Text(text))) => decode(&mut decoder, &text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => decode(&mut decoder, text),
                        Err(e) => vec![ChannelEvent::Error(format!("non-UTF-8 frame: {e}"))],
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        tracing::info!(reason = ?reason, "realtime channel closed by server");
                        let _ = events_tx.send(ChannelEvent::Closed { reason }).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "realtime channel error");
                        let _ = events_tx.send(ChannelEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = events_tx.send(ChannelEvent::Closed { reason: None }).await;
                        break;
                    }
                };

                for event in events {
                    if events_tx.send(event).await.is_err() {
                        tracing::debug!("session dropped the channel, stopping reader");
                        return;
                    }
                }
            }
        });

        tracing::info!("realtime channel open");
        Ok(DuplexChannel {
            sender,
            events: events_rx,
        })
    }
}

/// Read frames until `setupComplete`, returning anything decoded before it
async fn await_setup<S>(stream: &mut S, decoder: &mut ServerDecoder) -> Result<Vec<ChannelEvent>>
where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let mut early = Vec::new();

    loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => String::from_utf8(bytes)
                .map_err(|e| Error::Channel(format!("non-UTF-8 frame: {e}")))?,
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(Error::Channel(format!(
                    "closed before setup completed: {reason}"
                )));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(Error::Channel(
                    "closed before setup completed".to_string(),
                ));
            }
        };

        let mut ready = false;
        for event in decoder.decode(&text)? {
            match event {
                ChannelEvent::Ready => ready = true,
                other => early.push(other),
            }
        }
        if ready {
            return Ok(early);
        }
    }
}

fn decode(decoder: &mut ServerDecoder, text: &str) -> Vec<ChannelEvent> {
    decoder.decode(text).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "undecodable server frame");
        Vec::new()
    })
}

async fn write_loop<S>(mut sink: S, mut outbound: OutboundReceiver)
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            message = outbound.messages.recv() => {
                let Some(message) = message else { break };
                let json = match ClientMessage::from_outbound(message).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    tracing::debug!(error = %e, "realtime send failed, stopping writer");
                    break;
                }
            }
            changed = outbound.closed.changed() => {
                if changed.is_err() || *outbound.closed.borrow() {
                    // Flush what was queued before the close, tool results included
                    while let Ok(message) = outbound.messages.try_recv() {
                        let Ok(json) = ClientMessage::from_outbound(message).to_json() else {
                            continue;
                        };
                        if sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    }

    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
            reason: "session closed".into(),
        })))
        .await;
    let _ = sink.close().await;
    tracing::debug!("realtime writer stopped");
}
