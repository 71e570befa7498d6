//! Signaling transport: a best-effort broadcast channel scoped to a trip.
//!
//! The transport never interprets signals beyond decoding them; filtering by
//! recipient is the negotiation layer's job. Delivery is unacknowledged and
//! unordered: `send` is fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::{channel_name, Signal};

/// Frames a backend delivers for a subscribed topic.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(String),
    /// Identities currently tracked on the topic.
    Presence(Vec<String>),
}

/// Frames the transport hands to a backend for a subscribed topic.
#[derive(Debug, Clone)]
pub enum Outbound {
    Publish(String),
    Track(String),
    Leave,
}

/// A confirmed topic subscription. Dropping `outbound` (or sending
/// `Outbound::Leave`) ends it; `inbound` closes when the backend goes away.
pub struct Subscription {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("signaling channel {topic} was not ready within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
    #[error("signaling backend unreachable: {0}")]
    Unreachable(String),
    #[error("signaling subscription rejected: {0}")]
    Rejected(String),
}

/// The realtime service the transport rides on.
#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    /// Subscribe to `topic`, resolving once the subscription is confirmed.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;
}

/// Handle for the currently open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    pub trip_id: String,
    pub topic: String,
}

struct OpenChannel {
    handle: ChannelHandle,
    outbound: mpsc::UnboundedSender<Outbound>,
    pump: JoinHandle<()>,
}

impl OpenChannel {
    fn shutdown(self) {
        let _ = self.outbound.send(Outbound::Leave);
        self.pump.abort();
    }
}

pub struct SignalingTransport {
    backend: Arc<dyn RealtimeBackend>,
    setup_timeout: Duration,
    /// Serializes `open` so concurrent callers share one subscription.
    open_lock: tokio::sync::Mutex<()>,
    channel: Arc<Mutex<Option<OpenChannel>>>,
    signals: broadcast::Sender<Signal>,
    presence: Arc<watch::Sender<usize>>,
}

impl SignalingTransport {
    pub fn new(backend: Arc<dyn RealtimeBackend>, setup_timeout: Duration) -> Self {
        let (signals, _) = broadcast::channel(64);
        let (presence, _) = watch::channel(0);
        let presence = Arc::new(presence);
        Self {
            backend,
            setup_timeout,
            open_lock: tokio::sync::Mutex::new(()),
            channel: Arc::new(Mutex::new(None)),
            signals,
            presence,
        }
    }

    /// Open the channel for `trip_id`, reusing it if it is already open.
    /// Opening a different trip replaces the current channel.
    pub async fn open(&self, trip_id: &str) -> Result<ChannelHandle, TransportError> {
        let _guard = self.open_lock.lock().await;

        if let Some(open) = self.channel.lock().as_ref() {
            if open.handle.trip_id == trip_id {
                tracing::debug!("Reusing signaling channel {}", open.handle.topic);
                return Ok(open.handle.clone());
            }
        }
        self.close();

        let topic = channel_name(trip_id);
        tracing::info!("Opening signaling channel {}", topic);

        let subscription = tokio::time::timeout(self.setup_timeout, self.backend.subscribe(&topic))
            .await
            .map_err(|_| TransportError::Timeout {
                topic: topic.clone(),
                timeout: self.setup_timeout,
            })??;

        let handle = ChannelHandle {
            trip_id: trip_id.to_string(),
            topic,
        };
        let pump = tokio::spawn(pump_inbound(
            handle.topic.clone(),
            subscription.inbound,
            self.signals.clone(),
            self.presence.clone(),
            Arc::downgrade(&self.channel),
        ));

        *self.channel.lock() = Some(OpenChannel {
            handle: handle.clone(),
            outbound: subscription.outbound,
            pump,
        });

        tracing::info!("Signaling channel {} ready", handle.topic);
        Ok(handle)
    }

    pub fn is_open_for(&self, trip_id: &str) -> bool {
        self.channel
            .lock()
            .as_ref()
            .map(|c| c.handle.trip_id == trip_id)
            .unwrap_or(false)
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.channel.lock().as_ref().map(|c| c.handle.clone())
    }

    /// Fire-and-forget. A send on a channel that is not ready is logged and
    /// dropped; it never blocks and never fails the caller.
    pub fn send(&self, signal: &Signal) {
        let payload = match signal.to_json() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Dropping unencodable {} signal: {}", signal.kind(), e);
                return;
            }
        };

        let guard = self.channel.lock();
        let Some(open) = guard.as_ref() else {
            tracing::warn!(
                "Signaling channel not ready, dropping {} signal to {}",
                signal.kind(),
                signal.to
            );
            return;
        };

        tracing::debug!("Signal out on {}: {} -> {}", open.handle.topic, signal.kind(), signal.to);
        if open.outbound.send(Outbound::Publish(payload)).is_err() {
            tracing::warn!("Signaling backend gone, dropped {} signal", signal.kind());
        }
    }

    /// Every decoded signal on the channel, whoever it is addressed to.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    /// Announce `user_id` as present on the channel.
    pub fn track_presence(&self, user_id: &str) {
        if let Some(open) = self.channel.lock().as_ref() {
            let _ = open.outbound.send(Outbound::Track(user_id.to_string()));
        }
    }

    /// Count of participants attached to the channel. Diagnostic only.
    pub fn presence(&self) -> watch::Receiver<usize> {
        self.presence.subscribe()
    }

    /// Unsubscribe. Later `send`s are no-ops.
    pub fn close(&self) {
        if let Some(open) = self.channel.lock().take() {
            tracing::info!("Closing signaling channel {}", open.handle.topic);
            open.shutdown();
        }
        self.presence.send_replace(0);
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        if let Some(open) = self.channel.lock().take() {
            open.shutdown();
        }
    }
}

async fn pump_inbound(
    topic: String,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    signals: broadcast::Sender<Signal>,
    presence: Arc<watch::Sender<usize>>,
    channel: std::sync::Weak<Mutex<Option<OpenChannel>>>,
) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Inbound::Message(payload) => match Signal::from_json(&payload) {
                Ok(signal) => {
                    tracing::debug!(
                        "Signal in on {}: {} {} -> {}",
                        topic,
                        signal.kind(),
                        signal.from,
                        signal.to
                    );
                    // No subscribers is fine; nobody is listening yet.
                    let _ = signals.send(signal);
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed signal on {}: {}", topic, e);
                }
            },
            Inbound::Presence(users) => {
                tracing::debug!("Presence on {}: {} attached", topic, users.len());
                presence.send_replace(users.len());
            }
        }
    }

    tracing::warn!("Signaling backend closed channel {}", topic);
    presence.send_replace(0);
    // Forget the dead subscription so the next `open` resubscribes. The
    // channel slot may already hold a newer subscription for another topic.
    if let Some(channel) = channel.upgrade() {
        let mut guard = channel.lock();
        if guard.as_ref().map(|c| c.handle.topic == topic).unwrap_or(false) {
            // Dropping the handle detaches this task rather than aborting it.
            guard.take();
        }
    }
}
