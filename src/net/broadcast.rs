use crate::entities::creature::{CharacterId, ShardId};
use crate::net::bus::{self, BusHandler, Envelope, MessageBus, SubscriptionId};
use crate::net::codec::EventEncoder;
use crate::net::events::{Message, Routing, Scope, Subject};
use crate::net::session::{Session, SessionId};
use crate::telemetry::logging;
use crate::world::observer::ObserverView;
use lru::LruCache;
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;

/// Resolves which shard a character currently lives in.
pub trait ShardLocator: Send + Sync {
    fn shard_of(&self, character: CharacterId) -> Option<ShardId>;
}

struct SessionSlot {
    session: Arc<dyn Session>,
    character: CharacterId,
    view: Arc<ObserverView>,
}

impl SessionSlot {
    fn matches(&self, scope: Scope, locator: &dyn ShardLocator) -> bool {
        match scope {
            Scope::Unscoped => true,
            Scope::SingleSession(id) => self.session.id() == id,
            Scope::AllInShard(shard) => locator.shard_of(self.character) == Some(shard),
            Scope::NearObserversOf(Subject::Character(character)) if character == self.character => {
                true
            }
            Scope::NearObserversOf(subject) => self.view.holds(subject),
        }
    }
}

struct Outbound {
    message: Message,
    from_bus: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    pub published: u64,
    pub delivered: u64,
    pub failed_writes: u64,
    pub forwarded: u64,
    pub received: u64,
}

struct BroadcastInner {
    process_id: u32,
    encoder: Arc<dyn EventEncoder>,
    locator: Arc<dyn ShardLocator>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    queue: Mutex<VecDeque<Outbound>>,
    ready: Condvar,
    stopped: AtomicBool,
    failed: Mutex<Vec<SessionId>>,
    seen: Mutex<LruCache<(u32, u64), ()>>,
    next_message_id: AtomicU64,
    bus: RwLock<Option<Arc<dyn MessageBus>>>,
    subscriptions: Mutex<HashMap<String, SubscriptionId>>,
    shards: Mutex<HashSet<ShardId>>,
    published: AtomicU64,
    delivered: AtomicU64,
    failed_writes: AtomicU64,
    forwarded: AtomicU64,
    received: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BroadcastInner {
    fn enqueue(&self, outbound: Outbound) {
        lock(&self.queue).push_back(outbound);
        self.ready.notify_one();
    }

    fn bus(&self) -> Option<Arc<dyn MessageBus>> {
        self.bus
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn deliver(&self, outbound: Outbound) {
        let Outbound { message, from_bus } = outbound;
        if !from_bus && message.routing == Routing::Cluster {
            self.forward(&message);
        }

        let recipients: Vec<Arc<SessionSlot>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.matches(message.scope, self.locator.as_ref()))
            .cloned()
            .collect();
        if recipients.is_empty() {
            return;
        }

        let frame = self.encoder.encode(&message.event);
        for slot in recipients {
            let id = slot.session.id();
            let result = if slot.session.is_alive() {
                slot.session.write(&frame)
            } else {
                Err(format!("session {} is closed", id))
            };
            match result {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.failed_writes.fetch_add(1, Ordering::Relaxed);
                    logging::log_netload(&format!("delivery to session {} failed: {}", id, err));
                    self.mark_failed(id);
                }
            }
        }
    }

    fn mark_failed(&self, id: SessionId) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            lock(&self.failed).push(id);
        }
    }

    fn forward(&self, message: &Message) {
        let Some(bus) = self.bus() else {
            return;
        };
        let topic = match message.scope {
            Scope::SingleSession(session) => bus::session_topic(session),
            Scope::AllInShard(shard) => bus::shard_topic(shard),
            Scope::NearObserversOf(_) | Scope::Unscoped => bus::TOPIC_ALL.to_string(),
        };
        let envelope = Envelope {
            origin: self.process_id,
            message_id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            message: message.clone(),
        };
        let result = envelope
            .encode()
            .and_then(|payload| bus.publish(&topic, &payload));
        match result {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => logging::log_netload(&format!("bus publish on {} failed: {}", topic, err)),
        }
    }

    fn receive(&self, topic: &str, payload: &[u8]) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                logging::log_netload(&format!("dropping envelope on {}: {}", topic, err));
                return;
            }
        };
        if envelope.origin == self.process_id {
            return;
        }
        {
            let mut seen = lock(&self.seen);
            let key = (envelope.origin, envelope.message_id);
            if seen.contains(&key) {
                return;
            }
            seen.put(key, ());
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        self.enqueue(Outbound {
            message: envelope.message,
            from_bus: true,
        });
    }

    fn subscribe(self: &Arc<Self>, topic: String) {
        let Some(bus) = self.bus() else {
            return;
        };
        if lock(&self.subscriptions).contains_key(&topic) {
            return;
        }
        let weak: Weak<BroadcastInner> = Arc::downgrade(self);
        let handler: BusHandler = Arc::new(move |topic: &str, payload: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(topic, payload);
            }
        });
        match bus.subscribe(&topic, handler) {
            Ok(id) => {
                lock(&self.subscriptions).insert(topic, id);
            }
            Err(err) => logging::log_netload(&format!("bus subscribe to {} failed: {}", topic, err)),
        }
    }

    fn unsubscribe(&self, topic: &str) {
        let Some(id) = lock(&self.subscriptions).remove(topic) else {
            return;
        };
        if let Some(bus) = self.bus() {
            bus.unsubscribe(id);
        }
    }
}

/// Fan-out of world events to sessions. `publish` only enqueues; a single
/// dispatcher drains the queue in order, so frames for one session keep
/// their publish order.
pub struct Broadcast {
    inner: Arc<BroadcastInner>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Broadcast {
    pub fn new(
        process_id: u32,
        encoder: Arc<dyn EventEncoder>,
        locator: Arc<dyn ShardLocator>,
        dedup_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(dedup_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(BroadcastInner {
                process_id,
                encoder,
                locator,
                sessions: RwLock::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                stopped: AtomicBool::new(false),
                failed: Mutex::new(Vec::new()),
                seen: Mutex::new(LruCache::new(capacity)),
                next_message_id: AtomicU64::new(1),
                bus: RwLock::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                shards: Mutex::new(HashSet::new()),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed_writes: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
                received: AtomicU64::new(0),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.inner.process_id
    }

    /// Joins the cluster: listens on the shared topic, every shard topic
    /// requested so far and the topics of every session already registered.
    pub fn connect_bus(&self, bus: Arc<dyn MessageBus>) {
        *self
            .inner
            .bus
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(bus);
        self.inner.subscribe(bus::TOPIC_ALL.to_string());
        let sessions: Vec<SessionId> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for session in sessions {
            self.inner.subscribe(bus::session_topic(session));
        }
        let shards: Vec<ShardId> = lock(&self.inner.shards).iter().copied().collect();
        for shard in shards {
            self.inner.subscribe(bus::shard_topic(shard));
        }
    }

    /// Remembered across `connect_bus`, so shards may be announced before
    /// the bus exists.
    pub fn subscribe_shard(&self, shard: ShardId) {
        lock(&self.inner.shards).insert(shard);
        self.inner.subscribe(bus::shard_topic(shard));
    }

    pub fn register(
        &self,
        session: Arc<dyn Session>,
        character: CharacterId,
        view: Arc<ObserverView>,
    ) -> bool {
        let id = session.id();
        {
            let mut sessions = self
                .inner
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if sessions.contains_key(&id) {
                return false;
            }
            sessions.insert(
                id,
                Arc::new(SessionSlot {
                    session,
                    character,
                    view,
                }),
            );
        }
        self.inner.subscribe(bus::session_topic(id));
        true
    }

    pub fn unregister(&self, id: SessionId) -> bool {
        let removed = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        self.inner.unsubscribe(&bus::session_topic(id));
        removed
    }

    pub fn is_registered(&self, id: SessionId) -> bool {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Fire-and-forget; never waits on a socket.
    pub fn publish(&self, message: Message) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.enqueue(Outbound {
            message,
            from_bus: false,
        });
    }

    /// Delivers everything queued so far on the calling thread.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = lock(&self.inner.queue).pop_front();
            let Some(outbound) = next else {
                return delivered;
            };
            self.inner.deliver(outbound);
            delivered += 1;
        }
    }

    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn start_dispatcher(&self) -> Result<(), String> {
        let mut dispatcher = lock(&self.dispatcher);
        if dispatcher.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("overworld-broadcast".to_string())
            .spawn(move || dispatch_loop(inner))
            .map_err(|err| format!("broadcast dispatcher spawn failed: {}", err))?;
        *dispatcher = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.ready.notify_all();
        if let Some(handle) = lock(&self.dispatcher).take() {
            if handle.join().is_err() {
                logging::log_error("broadcast dispatcher panicked");
            }
        }
    }

    /// Sessions whose writes failed since the last call.
    pub fn take_failed(&self) -> Vec<SessionId> {
        std::mem::take(&mut *lock(&self.inner.failed))
    }

    pub fn stats(&self) -> BroadcastStats {
        let inner = &self.inner;
        BroadcastStats {
            published: inner.published.load(Ordering::Relaxed),
            delivered: inner.delivered.load(Ordering::Relaxed),
            failed_writes: inner.failed_writes.load(Ordering::Relaxed),
            forwarded: inner.forwarded.load(Ordering::Relaxed),
            received: inner.received.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Broadcast {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(inner: Arc<BroadcastInner>) {
    loop {
        let next = {
            let mut queue = lock(&inner.queue);
            loop {
                if inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(outbound) = queue.pop_front() {
                    break outbound;
                }
                queue = inner
                    .ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        inner.deliver(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::creature::{EntityId, PresentationId};
    use crate::net::bus::LocalBus;
    use crate::net::codec::{PacketEncoder, OP_ENTITY_MOVE, OP_PLAYER_DISAPPEAR};
    use crate::net::events::WorldEvent;
    use crate::net::session::MemorySession;
    use crate::world::observer::{Category, SeenEntry};
    use crate::world::position::Position;
    use std::time::Duration;

    struct FixedShard(HashMap<CharacterId, ShardId>);

    impl ShardLocator for FixedShard {
        fn shard_of(&self, character: CharacterId) -> Option<ShardId> {
            self.0.get(&character).copied()
        }
    }

    fn broadcast(process_id: u32) -> Broadcast {
        let mut shards = HashMap::new();
        shards.insert(CharacterId(1), ShardId(1));
        shards.insert(CharacterId(2), ShardId(2));
        Broadcast::new(
            process_id,
            Arc::new(PacketEncoder),
            Arc::new(FixedShard(shards)),
            16,
        )
    }

    fn attach(
        channel: &Broadcast,
        session: u64,
        character: u32,
    ) -> (Arc<MemorySession>, Arc<ObserverView>) {
        let session = Arc::new(MemorySession::new(SessionId(session)));
        let view = Arc::new(ObserverView::new(CharacterId(character)));
        assert!(channel.register(session.clone(), CharacterId(character), Arc::clone(&view)));
        (session, view)
    }

    fn moved(id: u16) -> WorldEvent {
        WorldEvent::EntityMove {
            presentation_id: PresentationId(id),
            position: Position::new(1.0, 1.0),
        }
    }

    #[test]
    fn near_observers_scope_checks_views_at_delivery() {
        let channel = broadcast(1);
        let (watching, view) = attach(&channel, 10, 1);
        let (elsewhere, _) = attach(&channel, 11, 2);
        let subject = Subject::Entity {
            category: Category::Monsters,
            id: EntityId(5),
        };

        channel.publish(Message::local(moved(3), Scope::NearObserversOf(subject)));
        // Membership is evaluated when the dispatcher runs, not at publish.
        view.lock_entities(Category::Monsters)
            .expect("monsters")
            .insert(
                EntityId(5),
                SeenEntry {
                    presentation_id: PresentationId(3),
                    generation: 0,
                },
            );
        assert_eq!(channel.pump(), 1);

        let frames = watching.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], OP_ENTITY_MOVE);
        assert!(elsewhere.frames().is_empty());
    }

    #[test]
    fn shard_and_single_session_scopes() {
        let channel = broadcast(1);
        let (first, _) = attach(&channel, 10, 1);
        let (second, _) = attach(&channel, 11, 2);

        channel.publish(Message::local(moved(1), Scope::AllInShard(ShardId(2))));
        channel.publish(Message::local(moved(2), Scope::SingleSession(SessionId(10))));
        channel.publish(Message::local(moved(3), Scope::Unscoped));
        channel.pump();

        assert_eq!(first.frames().len(), 2);
        assert_eq!(second.frames().len(), 2);
    }

    #[test]
    fn character_subject_includes_the_character_itself() {
        let channel = broadcast(1);
        let (own, _) = attach(&channel, 10, 1);
        let (other, other_view) = attach(&channel, 11, 2);
        other_view.lock_players().insert(CharacterId(1));
        let (stranger, _) = attach(&channel, 12, 3);

        channel.publish(Message::local(
            WorldEvent::PlayerDisappear {
                character: CharacterId(1),
            },
            Scope::NearObserversOf(Subject::Character(CharacterId(1))),
        ));
        channel.pump();
        assert_eq!(own.frames()[0][0], OP_PLAYER_DISAPPEAR);
        assert_eq!(other.frames().len(), 1);
        assert!(stranger.frames().is_empty());
    }

    #[test]
    fn failed_write_isolates_only_that_session() {
        let channel = broadcast(1);
        let (broken, _) = attach(&channel, 10, 1);
        let (healthy, _) = attach(&channel, 11, 2);
        broken.fail_writes(true);

        channel.publish(Message::local(moved(1), Scope::Unscoped));
        channel.publish(Message::local(moved(2), Scope::Unscoped));
        channel.pump();

        assert_eq!(healthy.frames().len(), 2);
        assert!(!channel.is_registered(SessionId(10)));
        assert_eq!(channel.take_failed(), vec![SessionId(10)]);
        assert!(channel.take_failed().is_empty());
        assert_eq!(channel.stats().failed_writes, 1);
    }

    #[test]
    fn cluster_messages_cross_processes_once() {
        let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
        let left = broadcast(1);
        let right = broadcast(2);
        left.connect_bus(bus.clone());
        right.connect_bus(bus.clone());
        let (remote, _) = attach(&right, 20, 2);

        left.publish(Message::cluster(moved(4), Scope::SingleSession(SessionId(20))));
        left.pump();
        assert_eq!(right.queued(), 1);
        right.pump();
        assert_eq!(remote.frames().len(), 1);

        // A replayed envelope is ignored, and so is our own traffic.
        let envelope = Envelope {
            origin: 1,
            message_id: 1,
            message: Message::cluster(moved(4), Scope::SingleSession(SessionId(20))),
        };
        let payload = envelope.encode().expect("encode");
        bus.publish(&bus::session_topic(SessionId(20)), &payload)
            .expect("publish");
        assert_eq!(right.queued(), 0);
        let own = Envelope { origin: 2, ..envelope };
        bus.publish(bus::TOPIC_ALL, &own.encode().expect("encode"))
            .expect("publish");
        assert_eq!(right.queued(), 0);
        assert_eq!(right.stats().received, 1);
    }

    #[test]
    fn shard_announced_before_the_bus_still_receives() {
        let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
        let left = broadcast(1);
        let right = broadcast(2);
        right.subscribe_shard(ShardId(2));
        let (remote, _) = attach(&right, 20, 2);
        let (other_shard, _) = attach(&right, 21, 1);
        left.connect_bus(bus.clone());
        right.connect_bus(bus.clone());
        assert_eq!(bus.subscriber_count("overworld.shard.2"), 1);

        left.publish(Message::cluster(moved(6), Scope::AllInShard(ShardId(2))));
        left.pump();
        assert_eq!(right.queued(), 1);
        right.pump();
        assert_eq!(remote.frames().len(), 1);
        assert!(other_shard.frames().is_empty());
    }

    #[test]
    fn unregister_drops_session_topic() {
        let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
        let channel = broadcast(1);
        channel.connect_bus(bus.clone());
        attach(&channel, 30, 1);
        assert_eq!(bus.subscriber_count("overworld.session.30"), 1);
        assert!(channel.unregister(SessionId(30)));
        assert_eq!(bus.subscriber_count("overworld.session.30"), 0);
    }

    #[test]
    fn dispatcher_delivers_in_publish_order() {
        let channel = broadcast(1);
        let (session, _) = attach(&channel, 10, 1);
        channel.start_dispatcher().expect("dispatcher");
        for id in 0..20 {
            channel.publish(Message::local(moved(id), Scope::Unscoped));
        }
        for _ in 0..200 {
            if session.frames().len() == 20 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        channel.stop();
        let ids: Vec<u8> = session.frames().iter().map(|frame| frame[1]).collect();
        assert_eq!(ids, (0..20).collect::<Vec<u8>>());
    }
}
