use crate::entities::character::{Character, CharacterState};
use crate::entities::creature::{CharacterId, EntityId, MapKey, Relation};
use crate::net::broadcast::Broadcast;
use crate::net::events::{Message, Scope, WorldEvent};
use crate::net::session::{Session, SessionId};
use crate::runtime::scheduler::{Scheduler, SchedulerError, TaskGroup, TaskStep};
use crate::runtime::timers::TaskId;
use crate::telemetry::logging;
use crate::world::observer::{Category, ObserverView, SeenEntry};
use crate::world::registry::{EntityRegistry, MapPartition};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityError {
    UnknownSession(SessionId),
    UnknownCharacter(CharacterId),
    AlreadyAttached(SessionId),
    Scheduler(SchedulerError),
}

impl fmt::Display for VisibilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisibilityError::UnknownSession(id) => write!(f, "session {} is not attached", id),
            VisibilityError::UnknownCharacter(id) => write!(f, "character {} is not in the world", id.0),
            VisibilityError::AlreadyAttached(id) => write!(f, "session {} is already attached", id),
            VisibilityError::Scheduler(err) => write!(f, "diff task refused: {}", err),
        }
    }
}

impl std::error::Error for VisibilityError {}

#[derive(Debug, Clone, Copy)]
pub struct VisibilityConfig {
    pub diff_interval: Duration,
    pub view_radius: f32,
    pub lag_budget: Duration,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            diff_interval: Duration::from_secs(1),
            view_radius: 15.0,
            lag_budget: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffReport {
    pub entered: usize,
    pub left: usize,
}

impl DiffReport {
    pub fn is_quiet(&self) -> bool {
        self.entered == 0 && self.left == 0
    }
}

struct Attachment {
    session: Arc<dyn Session>,
    character: CharacterId,
    view: Arc<ObserverView>,
    task: Mutex<Option<TaskId>>,
    /// Map the view's presentation ids belong to.
    map: Mutex<Option<MapKey>>,
    /// Held for a whole pass and while detaching, so a late pass cannot
    /// retain ids after the view was released.
    pass: Mutex<()>,
    detached: AtomicBool,
}

/// Messages and id releases produced by one pass, emitted after every
/// category set has been updated.
#[derive(Default)]
struct PassOutput {
    events: Vec<WorldEvent>,
    released: Vec<(Category, EntityId, SeenEntry)>,
    report: DiffReport,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-observer incremental visibility. Each attached session gets its own
/// recurring diff task that reconciles the observer's view with what the
/// registry currently reports nearby.
pub struct VisibilityEngine {
    registry: Arc<EntityRegistry>,
    broadcast: Arc<Broadcast>,
    scheduler: Arc<Scheduler>,
    config: VisibilityConfig,
    attachments: RwLock<HashMap<SessionId, Arc<Attachment>>>,
}

impl VisibilityEngine {
    pub fn new(
        registry: Arc<EntityRegistry>,
        broadcast: Arc<Broadcast>,
        scheduler: Arc<Scheduler>,
        config: VisibilityConfig,
    ) -> Self {
        Self {
            registry,
            broadcast,
            scheduler,
            config,
            attachments: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }

    fn attachment(&self, id: SessionId) -> Option<Arc<Attachment>> {
        self.attachments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn is_attached(&self, id: SessionId) -> bool {
        self.attachment(id).is_some()
    }

    pub fn attached_count(&self) -> usize {
        self.attachments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn view(&self, id: SessionId) -> Option<Arc<ObserverView>> {
        self.attachment(id).map(|attachment| Arc::clone(&attachment.view))
    }

    /// Registers the session with the broadcast channel and starts its diff
    /// task. The first pass runs as soon as a worker is free.
    pub fn attach(
        self: &Arc<Self>,
        session: Arc<dyn Session>,
        character: CharacterId,
    ) -> Result<Arc<ObserverView>, VisibilityError> {
        let id = session.id();
        if self.registry.character(character).is_none() {
            return Err(VisibilityError::UnknownCharacter(character));
        }
        let view = Arc::new(ObserverView::new(character));
        let attachment = Arc::new(Attachment {
            session: Arc::clone(&session),
            character,
            view: Arc::clone(&view),
            task: Mutex::new(None),
            map: Mutex::new(None),
            pass: Mutex::new(()),
            detached: AtomicBool::new(false),
        });
        {
            let mut attachments = self
                .attachments
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if attachments.contains_key(&id) {
                return Err(VisibilityError::AlreadyAttached(id));
            }
            if !self.broadcast.register(session, character, Arc::clone(&view)) {
                return Err(VisibilityError::AlreadyAttached(id));
            }
            attachments.insert(id, Arc::clone(&attachment));
        }

        let weak: Weak<VisibilityEngine> = Arc::downgrade(self);
        let scheduled = self.scheduler.schedule_recurring(
            Some(TaskGroup::Session(id)),
            Duration::ZERO,
            move || match weak.upgrade() {
                Some(engine) => engine.tick(id),
                None => TaskStep::Finish,
            },
        );
        match scheduled {
            Ok(task) => {
                *lock(&attachment.task) = Some(task);
                logging::log_debug(&format!(
                    "session {} attached to character {}",
                    id, character.0
                ));
                Ok(view)
            }
            Err(err) => {
                logging::log_warn(&format!("diff task for session {} refused: {}", id, err));
                self.detach(id);
                Err(VisibilityError::Scheduler(err))
            }
        }
    }

    /// Stops the diff task, unregisters the session and gives back every
    /// presentation id the view still held.
    pub fn detach(&self, id: SessionId) -> bool {
        let Some(attachment) = self
            .attachments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        else {
            return false;
        };
        if let Some(task) = lock(&attachment.task).take() {
            self.scheduler.cancel(task);
        }
        self.broadcast.unregister(id);

        let _pass = lock(&attachment.pass);
        attachment.detached.store(true, Ordering::SeqCst);
        let (_, entities) = attachment.view.drain();
        let map = *lock(&attachment.map);
        if let Some(partition) = map.and_then(|key| self.registry.partition(key)) {
            for (category, entity, seen) in entities {
                self.release(&partition, attachment.character, category, entity, seen);
            }
        }
        logging::log_debug(&format!("session {} detached", id));
        true
    }

    fn tick(&self, id: SessionId) -> TaskStep {
        let Some(attachment) = self.attachment(id) else {
            return TaskStep::Finish;
        };
        if !attachment.session.is_alive() {
            logging::log_debug(&format!("session {} lost, detaching", id));
            self.detach(id);
            return TaskStep::Finish;
        }
        self.run_pass(&attachment);
        TaskStep::Continue(self.config.diff_interval)
    }

    /// Runs one diff pass for the session right away.
    pub fn diff_pass(&self, id: SessionId) -> Result<DiffReport, VisibilityError> {
        let attachment = self
            .attachment(id)
            .ok_or(VisibilityError::UnknownSession(id))?;
        Ok(self.run_pass(&attachment))
    }

    fn run_pass(&self, attachment: &Attachment) -> DiffReport {
        let started = Instant::now();
        let _pass = lock(&attachment.pass);
        if attachment.detached.load(Ordering::SeqCst) {
            return DiffReport::default();
        }
        let mut output = PassOutput::default();

        let observer = self.registry.character(attachment.character);
        let previous = *lock(&attachment.map);
        let current = observer.as_ref().map(|character| character.map());
        if previous.is_some() && previous != current {
            self.forget_all(attachment, previous, &mut output);
        }
        *lock(&attachment.map) = current;

        let Some(observer) = observer else {
            logging::log_debug(&format!(
                "character {} of session {} is gone",
                attachment.character.0,
                attachment.session.id()
            ));
            return self.emit(attachment, previous, output);
        };
        let me = observer.snapshot();
        let partition = self.registry.partition(me.map);

        self.diff_players(attachment, &observer, &me, &mut output);
        for category in [Category::Monsters, Category::Npcs, Category::Pets] {
            self.diff_entities(attachment, partition.as_deref(), &me, category, &mut output);
        }
        self.diff_drops(attachment, partition.as_deref(), &me, &mut output);

        let report = self.emit(attachment, current, output);
        let spent = started.elapsed();
        if spent > self.config.lag_budget {
            logging::log_lag(&format!(
                "diff pass for session {} took {} ms",
                attachment.session.id(),
                spent.as_millis()
            ));
        }
        report
    }

    /// Publishes what the pass produced, then releases the ids of entities
    /// that left.
    fn emit(&self, attachment: &Attachment, map: Option<MapKey>, output: PassOutput) -> DiffReport {
        let session = attachment.session.id();
        for event in output.events {
            self.broadcast
                .publish(Message::local(event, Scope::SingleSession(session)));
        }
        if let Some(partition) = map.and_then(|key| self.registry.partition(key)) {
            for (category, entity, seen) in output.released {
                partition.release_view(seen.presentation_id);
                // A new incarnation of the same entity is still in view.
                if category == Category::Drops || attachment.view.seen(category, entity).is_some() {
                    continue;
                }
                if let Some(entity) = self.registry.get(partition.key(), entity) {
                    entity.remove_viewer(attachment.character);
                }
            }
        }
        output.report
    }

    fn forget_all(&self, attachment: &Attachment, map: Option<MapKey>, output: &mut PassOutput) {
        let (players, entities) = attachment.view.drain();
        for character in players {
            output.events.push(WorldEvent::PlayerDisappear { character });
            output.report.left += 1;
        }
        let partition = map.and_then(|key| self.registry.partition(key));
        for (category, entity, seen) in entities {
            output.events.push(WorldEvent::EntityDisappear {
                category,
                presentation_id: seen.presentation_id,
            });
            output.report.left += 1;
            if let Some(partition) = &partition {
                self.release(partition, attachment.character, category, entity, seen);
            }
        }
    }

    fn release(
        &self,
        partition: &MapPartition,
        observer: CharacterId,
        category: Category,
        entity: EntityId,
        seen: SeenEntry,
    ) {
        partition.release_view(seen.presentation_id);
        if category != Category::Drops {
            if let Some(entity) = self.registry.get(partition.key(), entity) {
                entity.remove_viewer(observer);
            }
        }
    }

    fn diff_players(
        &self,
        attachment: &Attachment,
        observer: &Character,
        me: &CharacterState,
        output: &mut PassOutput,
    ) {
        let candidates: HashMap<CharacterId, (Arc<Character>, CharacterState)> = self
            .registry
            .nearby_characters(me.map, me.position, self.config.view_radius)
            .into_iter()
            .filter(|character| character.id != observer.id)
            .map(|character| {
                let state = character.snapshot();
                (character.id, (character, state))
            })
            .filter(|(_, (_, state))| state.alive && !state.mounted && state.map == me.map)
            .collect();

        let (entering, leaving) = {
            let mut players = attachment.view.lock_players();
            let leaving: Vec<CharacterId> = players
                .iter()
                .filter(|id| !candidates.contains_key(id))
                .copied()
                .collect();
            for id in &leaving {
                players.remove(id);
            }
            let mut entering = Vec::new();
            for (id, (character, state)) in &candidates {
                if players.insert(*id) {
                    entering.push(WorldEvent::PlayerAppear {
                        character: *id,
                        name: character.name.clone(),
                        position: state.position,
                        health_percent: state.vitals.percent(),
                    });
                }
            }
            (entering, leaving)
        };

        output.report.left += leaving.len();
        output.report.entered += entering.len();
        output.events.extend(
            leaving
                .into_iter()
                .map(|character| WorldEvent::PlayerDisappear { character }),
        );
        output.events.extend(entering);
    }

    fn diff_entities(
        &self,
        attachment: &Attachment,
        partition: Option<&MapPartition>,
        me: &CharacterState,
        category: Category,
        output: &mut PassOutput,
    ) {
        let candidates = self.registry.nearby_entities(
            me.map,
            me.position,
            self.config.view_radius,
            Some(category),
        );
        let Some(mut set) = attachment.view.lock_entities(category) else {
            return;
        };
        let mut present: HashSet<EntityId> = HashSet::with_capacity(candidates.len());
        let mut leaving: Vec<(EntityId, SeenEntry)> = Vec::new();
        let mut entering: Vec<WorldEvent> = Vec::new();

        for entity in &candidates {
            let state = entity.state();
            if !state.alive {
                // Dead wins over a live query result.
                continue;
            }
            let Some(presentation_id) = state.presentation_id else {
                continue;
            };
            let current = SeenEntry {
                presentation_id,
                generation: state.generation,
            };
            let previous = set.get(&entity.id).copied();
            if previous == Some(current) {
                present.insert(entity.id);
                continue;
            }
            let Some(partition) = partition else {
                continue;
            };
            if !partition.retain_view(presentation_id) {
                logging::log_debug(&format!(
                    "presentation id {} of entity {} not live, skipping",
                    presentation_id.0, entity.id.0
                ));
                continue;
            }
            if let Some(previous) = previous {
                leaving.push((entity.id, previous));
            }
            set.insert(entity.id, current);
            present.insert(entity.id);
            entity.add_viewer(attachment.character);
            entering.push(WorldEvent::EntityAppear {
                category,
                presentation_id,
                template: entity.template.id,
                visual: entity.template.visual,
                position: state.position,
                health_percent: state.vitals.percent(),
                relation: Relation::between(
                    entity.template.faction,
                    entity.template.aggressive,
                    me.profile.faction,
                ),
            });
        }

        let gone: Vec<EntityId> = set
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        for id in gone {
            if let Some(previous) = set.remove(&id) {
                leaving.push((id, previous));
            }
        }
        drop(set);

        output.report.left += leaving.len();
        output.report.entered += entering.len();
        for (id, seen) in leaving {
            output.events.push(WorldEvent::EntityDisappear {
                category,
                presentation_id: seen.presentation_id,
            });
            output.released.push((category, id, seen));
        }
        output.events.extend(entering);
    }

    fn diff_drops(
        &self,
        attachment: &Attachment,
        partition: Option<&MapPartition>,
        me: &CharacterState,
        output: &mut PassOutput,
    ) {
        let now = Instant::now();
        let observer = attachment.character;
        let candidates = self
            .registry
            .nearby_drops(me.map, me.position, self.config.view_radius);
        let Some(mut set) = attachment.view.lock_entities(Category::Drops) else {
            return;
        };
        let mut present: HashSet<EntityId> = HashSet::with_capacity(candidates.len());
        let mut entering: Vec<WorldEvent> = Vec::new();

        for drop in &candidates {
            let state = drop.state();
            if state.gone {
                continue;
            }
            let Some(presentation_id) = state.presentation_id else {
                continue;
            };
            if set.contains_key(&drop.id) {
                present.insert(drop.id);
                continue;
            }
            let Some(partition) = partition else {
                continue;
            };
            if !partition.retain_view(presentation_id) {
                continue;
            }
            set.insert(
                drop.id,
                SeenEntry {
                    presentation_id,
                    generation: 0,
                },
            );
            present.insert(drop.id);
            entering.push(WorldEvent::DropAppear {
                presentation_id,
                position: drop.position,
                item: drop.payload.item,
                count: drop.payload.count,
                claimed_by_other: drop.claimed_by_other(observer, now),
            });
        }

        let gone: Vec<EntityId> = set
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        let leaving: Vec<(EntityId, SeenEntry)> = gone
            .into_iter()
            .filter_map(|id| set.remove(&id).map(|seen| (id, seen)))
            .collect();
        drop(set);

        output.report.left += leaving.len();
        output.report.entered += entering.len();
        for (id, seen) in leaving {
            output.events.push(WorldEvent::EntityDisappear {
                category: Category::Drops,
                presentation_id: seen.presentation_id,
            });
            output.released.push((Category::Drops, id, seen));
        }
        output.events.extend(entering);
    }

    /// Mounting hides a character from every observer at once instead of
    /// waiting for their next pass.
    pub fn set_mounted(&self, character: CharacterId, mounted: bool) -> bool {
        let Some(target) = self.registry.character(character) else {
            logging::log_debug(&format!("mount change for unknown character {}", character.0));
            return false;
        };
        target.state().mounted = mounted;
        if !mounted {
            return true;
        }
        let attachments: Vec<Arc<Attachment>> = self
            .attachments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for attachment in attachments {
            let removed = attachment.view.lock_players().remove(&character);
            if removed {
                self.broadcast.publish(Message::local(
                    WorldEvent::PlayerDisappear { character },
                    Scope::SingleSession(attachment.session.id()),
                ));
            }
        }
        true
    }

    pub fn detach_all(&self) -> usize {
        let ids: Vec<SessionId> = self
            .attachments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.into_iter().filter(|id| self.detach(*id)).count()
    }
}
