use crate::entities::creature::ShardId;
use crate::net::events::Message;
use crate::net::session::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

pub const TOPIC_ALL: &str = "overworld.all";

pub fn shard_topic(shard: ShardId) -> String {
    format!("overworld.shard.{}", shard.0)
}

pub fn session_topic(session: SessionId) -> String {
    format!("overworld.session.{}", session.0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    Closed,
    Encode(String),
    Decode(String),
    Transport(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Closed => write!(f, "bus closed"),
            BusError::Encode(err) => write!(f, "envelope encode failed: {}", err),
            BusError::Decode(err) => write!(f, "envelope decode failed: {}", err),
            BusError::Transport(err) => write!(f, "bus transport failed: {}", err),
        }
    }
}

impl std::error::Error for BusError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub type BusHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Inter-process transport. At-most-once, no ordering across topics.
pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;
    fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<SubscriptionId, BusError>;
    fn unsubscribe(&self, subscription: SubscriptionId) -> bool;
}

/// What actually travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: u32,
    pub message_id: u64,
    pub message: Message,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(self).map_err(|err| BusError::Encode(err.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(payload).map_err(|err| BusError::Decode(err.to_string()))
    }
}

/// In-process bus; handlers run synchronously on the publishing thread.
#[derive(Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, Vec<(SubscriptionId, BusHandler)>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let handlers: Vec<BusHandler> = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|subs| subs.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(topic, payload);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<SubscriptionId, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        topics.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(id, _)| *id != subscription);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::creature::CharacterId;
    use crate::net::events::{Scope, WorldEvent};
    use std::sync::Mutex;

    #[test]
    fn topic_names() {
        assert_eq!(shard_topic(ShardId(3)), "overworld.shard.3");
        assert_eq!(session_topic(SessionId(17)), "overworld.session.17");
    }

    #[test]
    fn delivers_only_to_matching_topic() {
        let bus = LocalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = bus
            .subscribe(
                "a",
                Arc::new(move |topic: &str, payload: &[u8]| {
                    sink.lock().expect("sink").push((topic.to_string(), payload.to_vec()));
                }),
            )
            .expect("subscribe");

        bus.publish("a", b"one").expect("publish");
        bus.publish("b", b"two").expect("publish");
        assert_eq!(seen.lock().expect("seen").len(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count("a"), 0);
        bus.publish("a", b"three").expect("publish");
        assert_eq!(seen.lock().expect("seen").len(), 1);
    }

    #[test]
    fn closed_bus_rejects_traffic() {
        let bus = LocalBus::new();
        bus.close();
        assert_eq!(bus.publish("a", b""), Err(BusError::Closed));
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let envelope = Envelope {
            origin: 2,
            message_id: 99,
            message: Message::cluster(
                WorldEvent::PlayerDisappear {
                    character: CharacterId(5),
                },
                Scope::SingleSession(SessionId(8)),
            ),
        };
        let bytes = envelope.encode().expect("encode");
        assert_eq!(Envelope::decode(&bytes).expect("decode"), envelope);
        assert!(matches!(Envelope::decode(b"{"), Err(BusError::Decode(_))));
    }
}
