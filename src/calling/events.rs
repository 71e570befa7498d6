//! Call notifications for any number of observers.
//!
//! The latest event of each kind is retained and replayed to observers that
//! subscribe after it fired; incoming-call detection races UI startup.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::media::MediaStream;
use super::{EndReason, NegotiationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IncomingCall,
    RemoteStream,
    StateChanged,
    CallEnded,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A call is ringing. Fires once per buffered offer.
    IncomingCall { from: String },
    RemoteStream(MediaStream),
    StateChanged(NegotiationState),
    CallEnded(EndReason),
}

impl CallEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CallEvent::IncomingCall { .. } => EventKind::IncomingCall,
            CallEvent::RemoteStream(_) => EventKind::RemoteStream,
            CallEvent::StateChanged(_) => EventKind::StateChanged,
            CallEvent::CallEnded(_) => EventKind::CallEnded,
        }
    }
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<mpsc::UnboundedSender<CallEvent>>,
    /// At most one event per kind, oldest first.
    retained: Vec<CallEvent>,
}

#[derive(Default)]
pub struct EventHub {
    inner: Mutex<Inner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// New observer. Retained events are delivered first, in the order they
    /// were published.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CallEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for event in &inner.retained {
            let _ = tx.send(event.clone());
        }
        inner.subscribers.push(tx);
        rx
    }

    pub fn publish(&self, event: CallEvent) {
        let mut inner = self.inner.lock();
        let kind = event.kind();
        inner.retained.retain(|e| e.kind() != kind);
        inner.retained.push(event.clone());
        inner
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Stop replaying `kind` to future observers.
    pub fn forget(&self, kind: EventKind) {
        self.inner.lock().retained.retain(|e| e.kind() != kind);
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}
