use crate::combat::resolution::CombatResolution;
use crate::config::EngineConfig;
use crate::entities::creature::{CharacterId, EntityId, MapKey, ShardId, TemplateId};
use crate::entities::drop::DropPayload;
use crate::entities::entity::{Entity, SpawnPoint};
use crate::entities::template::TemplateLookup;
use crate::net::broadcast::Broadcast;
use crate::net::bus::MessageBus;
use crate::net::codec::PacketEncoder;
use crate::persistence::journal::{LootRecord, WorldJournal};
use crate::runtime::rng::GameRng;
use crate::runtime::scheduler::{Scheduler, TaskGroup};
use crate::telemetry::logging;
use crate::world::behavior::BehaviorLoop;
use crate::world::behavior_rules::RuleBook;
use crate::world::loader::{WorldDefinition, WorldReport};
use crate::world::registry::{EntityRegistry, LootError, SpawnError};
use crate::world::visibility::VisibilityEngine;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    Shutdown,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerSignal {
    Running = 0,
    Shutdown = 1,
    Restart = 2,
}

#[derive(Debug)]
pub struct ServerControl {
    signal: AtomicU8,
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            signal: AtomicU8::new(ServerSignal::Running as u8),
        }
    }

    pub fn request_shutdown(&self) {
        self.signal.store(ServerSignal::Shutdown as u8, Ordering::SeqCst);
    }

    pub fn request_restart(&self) {
        self.signal.store(ServerSignal::Restart as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        matches!(self.current_signal(), ServerSignal::Running)
    }

    pub fn exit_reason(&self) -> ServerExit {
        match self.current_signal() {
            ServerSignal::Restart => ServerExit::Restart,
            _ => ServerExit::Shutdown,
        }
    }

    fn current_signal(&self) -> ServerSignal {
        match self.signal.load(Ordering::SeqCst) {
            2 => ServerSignal::Restart,
            1 => ServerSignal::Shutdown,
            _ => ServerSignal::Running,
        }
    }
}

/// Owns one process's share of the live world and wires the subsystems
/// together.
pub struct WorldHost {
    config: EngineConfig,
    registry: Arc<EntityRegistry>,
    scheduler: Arc<Scheduler>,
    broadcast: Arc<Broadcast>,
    journal: Arc<dyn WorldJournal>,
    templates: Arc<dyn TemplateLookup>,
    rule_book: Arc<RuleBook>,
    combat: Arc<CombatResolution>,
    behavior: Arc<BehaviorLoop>,
    visibility: Arc<VisibilityEngine>,
    rng: Mutex<GameRng>,
}

impl WorldHost {
    /// Starts worker threads and the broadcast dispatcher.
    pub fn start(
        config: EngineConfig,
        templates: Arc<dyn TemplateLookup>,
        journal: Arc<dyn WorldJournal>,
    ) -> Result<Self, String> {
        let scheduler = Scheduler::start(config.worker_threads, config.max_tasks);
        let host = Self::with_scheduler(config, scheduler, templates, journal, GameRng::from_time());
        host.broadcast.start_dispatcher()?;
        Ok(host)
    }

    /// Builds the host around an existing scheduler without starting any
    /// threads of its own.
    pub fn with_scheduler(
        config: EngineConfig,
        scheduler: Arc<Scheduler>,
        templates: Arc<dyn TemplateLookup>,
        journal: Arc<dyn WorldJournal>,
        rng: GameRng,
    ) -> Self {
        let mut rng = rng;
        let registry = Arc::new(EntityRegistry::new(config.registry()));
        let broadcast = Arc::new(Broadcast::new(
            config.process_id,
            Arc::new(PacketEncoder),
            registry.clone(),
            config.bus_dedup_capacity,
        ));
        let rule_book = Arc::new(RuleBook::new());
        let combat = Arc::new(CombatResolution::new(
            Arc::clone(&registry),
            Arc::clone(&broadcast),
            Arc::clone(&scheduler),
            Arc::clone(&journal),
            config.combat(),
            Arc::clone(&rule_book),
            fork(&mut rng),
        ));
        let behavior = Arc::new(BehaviorLoop::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&broadcast),
            Arc::clone(&combat),
            Arc::clone(&rule_book),
            config.behavior(),
            fork(&mut rng),
        ));
        let visibility = Arc::new(VisibilityEngine::new(
            Arc::clone(&registry),
            Arc::clone(&broadcast),
            Arc::clone(&scheduler),
            config.visibility(),
        ));
        Self {
            config,
            registry,
            scheduler,
            broadcast,
            journal,
            templates,
            rule_book,
            combat,
            behavior,
            visibility,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn broadcast(&self) -> &Arc<Broadcast> {
        &self.broadcast
    }

    pub fn rule_book(&self) -> &Arc<RuleBook> {
        &self.rule_book
    }

    pub fn combat(&self) -> &Arc<CombatResolution> {
        &self.combat
    }

    pub fn behavior(&self) -> &Arc<BehaviorLoop> {
        &self.behavior
    }

    pub fn visibility(&self) -> &Arc<VisibilityEngine> {
        &self.visibility
    }

    pub fn connect_bus(&self, bus: Arc<dyn MessageBus>) {
        self.broadcast.connect_bus(bus);
    }

    /// Creates every map of the definition and fills it from its spawn
    /// areas. Refused spawns are logged and skipped.
    pub fn load_world(&self, world: &WorldDefinition) -> WorldReport {
        let mut report = WorldReport {
            shards: world.shards.len(),
            ..WorldReport::default()
        };
        let mut unknown = BTreeSet::new();
        for shard in &world.shards {
            self.broadcast.subscribe_shard(ShardId(shard.id));
        }
        for (key, map) in world.maps() {
            self.registry.ensure_map(key);
            report.maps += 1;
            for spawn in &map.spawns {
                report.spawns += 1;
                if self.templates.template_for(spawn.template).is_none() {
                    logging::log_warn(&format!(
                        "map {} references unknown template {}",
                        key, spawn.template.0
                    ));
                    unknown.insert(spawn.template);
                    continue;
                }
                let placements = {
                    let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                    spawn.placements(&mut rng)
                };
                for position in placements {
                    let point = SpawnPoint {
                        position,
                        roam_radius: spawn.radius,
                    };
                    if self.spawn(key, spawn.template, point, None).is_ok() {
                        report.entities += 1;
                    }
                }
            }
        }
        report.unknown_templates = unknown.into_iter().collect();
        logging::log_game(&format!(
            "world loaded: {} maps, {} entities",
            report.maps, report.entities
        ));
        report
    }

    /// Registers a new entity and starts its behavior loop. Either both
    /// happen or neither does.
    pub fn spawn(
        &self,
        map: MapKey,
        template: TemplateId,
        spawn: SpawnPoint,
        owner: Option<CharacterId>,
    ) -> Result<Arc<Entity>, SpawnError> {
        let Some(template) = self.templates.template_for(template) else {
            logging::log_debug(&format!("spawn of unknown template {} on {}", template.0, map));
            return Err(SpawnError::UnknownTemplate(template));
        };
        let entity = Entity::new(self.registry.allocate_entity_id(), map, template, spawn, owner);
        let entity = self.registry.insert(entity).map_err(|err| {
            if matches!(err, SpawnError::Capacity { .. }) {
                logging::log_warn(&format!("spawn refused: {}", err));
            } else {
                logging::log_debug(&format!("spawn refused: {}", err));
            }
            err
        })?;
        if self.behavior.start(&entity).is_err() {
            self.registry.remove_entity(map, entity.id);
            return Err(SpawnError::Capacity {
                map,
                resource: "behavior loop",
            });
        }
        Ok(entity)
    }

    pub fn loot_drop(
        &self,
        looter: CharacterId,
        map: MapKey,
        drop: EntityId,
    ) -> Result<DropPayload, LootError> {
        let payload = self
            .registry
            .loot_drop(looter, map, drop, self.config.loot_radius, Instant::now())
            .map_err(|err| {
                logging::log_debug(&format!(
                    "loot of drop {} by character {} refused: {}",
                    drop.0, looter.0, err
                ));
                err
            })?;
        self.journal.record_loot(&LootRecord {
            looter,
            drop,
            item: payload.item,
            count: payload.count,
            map,
        });
        logging::log_game(&format!(
            "character {} looted {}x{} on {}",
            looter.0, payload.count, payload.item, map
        ));
        Ok(payload)
    }

    /// Cancels every loop, respawn and expiry on the map before detaching
    /// it, so nothing scheduled for it runs afterwards.
    pub fn teardown_map(&self, key: MapKey) -> bool {
        let cancelled = self.scheduler.cancel_group(TaskGroup::Map(key));
        match self.registry.teardown_map(key) {
            Some(_) => {
                logging::log_game(&format!("map {} closed, {} tasks cancelled", key, cancelled));
                true
            }
            None => false,
        }
    }

    /// Detaches sessions whose writes failed since the last call.
    pub fn reap_failed(&self) -> usize {
        let failed = self.broadcast.take_failed();
        failed
            .into_iter()
            .filter(|session| {
                let detached = self.visibility.detach(*session);
                if detached {
                    logging::log_netload(&format!("session {} dropped after failed write", session));
                }
                detached
            })
            .count()
    }

    pub fn load_sample(&self) -> u64 {
        self.registry.character_count() as u64
    }

    pub fn shutdown(&self) {
        let detached = self.visibility.detach_all();
        self.scheduler.shutdown();
        self.broadcast.stop();
        logging::log_game(&format!(
            "world host stopped, {} sessions detached",
            detached
        ));
    }
}

fn fork(rng: &mut GameRng) -> GameRng {
    let high = u64::from(rng.roll_range(0, u32::MAX));
    let low = u64::from(rng.roll_range(0, u32::MAX));
    GameRng::from_seed((high << 32) | low)
}
