//! In-process realtime backend: named broadcast topics with presence.
//!
//! Used directly by tests and as the fan-out core of the WebSocket relay.
//! A published payload reaches every other member of the topic, never the
//! publisher itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::transport::{Inbound, Outbound, RealtimeBackend, Subscription, TransportError};

struct Member {
    inbound: mpsc::UnboundedSender<Inbound>,
    user: Option<String>,
}

#[derive(Default)]
struct HubState {
    topics: RwLock<HashMap<String, HashMap<u64, Member>>>,
    next_id: AtomicU64,
}

impl HubState {
    fn join(&self, topic: &str) -> (u64, mpsc::UnboundedReceiver<Inbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.write().entry(topic.to_string()).or_default().insert(
            id,
            Member {
                inbound: tx,
                user: None,
            },
        );
        tracing::debug!("Hub: member {} joined {}", id, topic);
        (id, rx)
    }

    fn deliver(&self, topic: &str, from: u64, payload: String) {
        let topics = self.topics.read();
        let Some(members) = topics.get(topic) else {
            return;
        };
        for (id, member) in members {
            if *id != from {
                let _ = member.inbound.send(Inbound::Message(payload.clone()));
            }
        }
    }

    fn track(&self, topic: &str, id: u64, user: String) {
        let mut topics = self.topics.write();
        if let Some(member) = topics.get_mut(topic).and_then(|m| m.get_mut(&id)) {
            member.user = Some(user);
        }
        if let Some(members) = topics.get(topic) {
            broadcast_presence(members);
        }
    }

    fn leave(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write();
        let now_empty = match topics.get_mut(topic) {
            Some(members) => {
                members.remove(&id);
                broadcast_presence(members);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            topics.remove(topic);
        }
        tracing::debug!("Hub: member {} left {}", id, topic);
    }
}

fn broadcast_presence(members: &HashMap<u64, Member>) {
    let mut users: Vec<String> = members.values().filter_map(|m| m.user.clone()).collect();
    users.sort();
    users.dedup();
    for member in members.values() {
        let _ = member.inbound.send(Inbound::Presence(users.clone()));
    }
}

#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<HubState>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current subscriber count on `topic`.
    pub fn member_count(&self, topic: &str) -> usize {
        self.state
            .topics
            .read()
            .get(topic)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl RealtimeBackend for LocalHub {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let (id, inbound) = self.state.join(topic);
        let (outbound, mut commands) = mpsc::unbounded_channel::<Outbound>();

        let state = self.state.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(cmd) = commands.recv().await {
                match cmd {
                    Outbound::Publish(payload) => state.deliver(&topic, id, payload),
                    Outbound::Track(user) => state.track(&topic, id, user),
                    Outbound::Leave => break,
                }
            }
            state.leave(&topic, id);
        });

        Ok(Subscription { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_skips_sender() {
        let hub = LocalHub::new();
        let mut a = hub.subscribe("t").await.unwrap();
        let mut b = hub.subscribe("t").await.unwrap();

        a.outbound.send(Outbound::Publish("hello".into())).unwrap();

        match b.inbound.recv().await.unwrap() {
            Inbound::Message(m) => assert_eq!(m, "hello"),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(a.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = LocalHub::new();
        let a = hub.subscribe("webrtc-1").await.unwrap();
        let mut b = hub.subscribe("webrtc-2").await.unwrap();

        a.outbound.send(Outbound::Publish("x".into())).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(b.inbound.try_recv().is_err());
    }

    async fn next_presence(sub: &mut Subscription) -> Vec<String> {
        loop {
            if let Inbound::Presence(users) = sub.inbound.recv().await.unwrap() {
                return users;
            }
        }
    }

    #[tokio::test]
    async fn test_presence_on_track_and_leave() {
        let hub = LocalHub::new();
        let mut a = hub.subscribe("t").await.unwrap();
        let b = hub.subscribe("t").await.unwrap();

        a.outbound.send(Outbound::Track("rider".into())).unwrap();
        assert_eq!(next_presence(&mut a).await, vec!["rider".to_string()]);

        b.outbound.send(Outbound::Track("driver".into())).unwrap();
        assert_eq!(
            next_presence(&mut a).await,
            vec!["driver".to_string(), "rider".to_string()]
        );

        b.outbound.send(Outbound::Leave).unwrap();
        assert_eq!(next_presence(&mut a).await, vec!["rider".to_string()]);
        assert_eq!(hub.member_count("t"), 1);
    }
}
