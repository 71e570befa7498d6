//! WebSocket realtime backend speaking the relay's JSON frame protocol.
//!
//! One WebSocket per subscribed topic. The connection counts as ready once
//! the relay confirms the join.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::transport::{Inbound, Outbound, RealtimeBackend, Subscription, TransportError};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Interval between client keepalive pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Relay protocol frames (JSON text messages, tagged by `op`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayFrame {
    /// client → relay: attach this connection to `topic`.
    Join { topic: String },
    /// relay → client: the join is confirmed.
    Joined { topic: String },
    /// client → relay: announce presence as `user`.
    Track { user: String },
    /// client → relay: fan `payload` out to the other members.
    Broadcast { payload: String },
    /// relay → client: a payload broadcast by another member.
    Message { payload: String },
    /// relay → client: users currently tracked on the topic.
    Presence { users: Vec<String> },
    /// client → relay: detach.
    Leave,
    /// relay → client: request refused.
    Error { reason: String },
}

impl RelayFrame {
    pub fn to_message(&self) -> Message {
        // Serializing a plain enum of strings cannot fail.
        Message::Text(serde_json::to_string(self).unwrap_or_default())
    }

    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!("Ignoring unparseable relay frame ({}): {}", e, text);
                None
            }
        }
    }
}

/// Realtime backend that connects to a signaling relay over WebSocket.
#[derive(Debug, Clone)]
pub struct WsBackend {
    url: String,
}

impl WsBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RealtimeBackend for WsBackend {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        tracing::info!("Connecting WebSocket to {}", self.url);

        let (mut stream, response) = connect_async(&self.url)
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", self.url, e)))?;
        tracing::debug!("WebSocket connected (status={})", response.status());

        let join = RelayFrame::Join {
            topic: topic.to_string(),
        };
        stream
            .send(join.to_message())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        wait_for_join(&mut stream, topic).await?;

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, commands) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(stream, topic.to_string(), commands, inbound_tx));

        Ok(Subscription { outbound, inbound })
    }
}

async fn wait_for_join(stream: &mut WsStream, topic: &str) -> Result<(), TransportError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match RelayFrame::parse(&text) {
                Some(RelayFrame::Joined { topic: joined }) if joined == topic => return Ok(()),
                Some(RelayFrame::Error { reason }) => return Err(TransportError::Rejected(reason)),
                _ => {}
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = stream.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(TransportError::Rejected(format!(
                    "relay closed during join: {:?}",
                    frame
                )));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TransportError::Unreachable(e.to_string())),
            None => {
                return Err(TransportError::Unreachable(
                    "relay closed during join".into(),
                ))
            }
        }
    }
}

async fn run_connection(
    mut stream: WsStream,
    topic: String,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let mut keepalive = time::interval(PING_INTERVAL);
    keepalive.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match RelayFrame::parse(&text) {
                    Some(RelayFrame::Message { payload }) => {
                        let _ = inbound.send(Inbound::Message(payload));
                    }
                    Some(RelayFrame::Presence { users }) => {
                        let _ = inbound.send(Inbound::Presence(users));
                    }
                    Some(RelayFrame::Error { reason }) => {
                        tracing::warn!("Relay error on {}: {}", topic, reason);
                    }
                    _ => {}
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = stream.send(Message::Pong(data)).await {
                        tracing::warn!("Failed to send pong on {}: {}", topic, e);
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("Relay closed {}: {:?}", topic, frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("WebSocket receive error on {}: {}", topic, e);
                    break;
                }
                None => break,
            },
            cmd = commands.recv() => {
                let frame = match cmd {
                    Some(Outbound::Publish(payload)) => RelayFrame::Broadcast { payload },
                    Some(Outbound::Track(user)) => RelayFrame::Track { user },
                    Some(Outbound::Leave) | None => {
                        let _ = stream.send(RelayFrame::Leave.to_message()).await;
                        let _ = stream.close(None).await;
                        break;
                    }
                };
                if let Err(e) = stream.send(frame.to_message()).await {
                    tracing::warn!("Failed to send on {}: {}", topic, e);
                    break;
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = stream.send(Message::Ping(Vec::new())).await {
                    tracing::warn!("Keepalive ping failed on {}: {}", topic, e);
                    break;
                }
            }
        }
    }

    tracing::debug!("WebSocket connection for {} finished", topic);
}
