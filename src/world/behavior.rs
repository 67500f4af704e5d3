use crate::combat::resolution::CombatResolution;
use crate::entities::character::CharacterState;
use crate::entities::creature::{CharacterId, EntityId};
use crate::entities::entity::{BehaviorState, Entity, EntityState};
use crate::net::broadcast::Broadcast;
use crate::net::events::{Message, Scope, Subject, WorldEvent};
use crate::runtime::rng::GameRng;
use crate::runtime::scheduler::{Scheduler, SchedulerError, TaskGroup, TaskStep};
use crate::runtime::timers::TaskId;
use crate::telemetry::logging;
use crate::world::behavior_rules::{BehaviorRules, RuleBook};
use crate::world::position::Position;
use crate::world::registry::{EntityRegistry, SpawnError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Distance a companion keeps from its owner.
const FOLLOW_DISTANCE: f32 = 2.0;

#[derive(Debug, Clone, Copy)]
pub struct BehaviorConfig {
    pub think_interval: Duration,
    pub roam_interval_min: Duration,
    pub roam_interval_max: Duration,
    pub respawn_delay: Duration,
    pub lag_budget: Duration,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            think_interval: Duration::from_millis(500),
            roam_interval_min: Duration::from_millis(3000),
            roam_interval_max: Duration::from_millis(8000),
            respawn_delay: Duration::from_secs(10),
            lag_budget: Duration::from_millis(50),
        }
    }
}

/// What one iteration decided to do once perception is done.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Plan {
    Strike(CharacterId),
    MoveTo {
        destination: Position,
        state: BehaviorState,
    },
    Rest(BehaviorState),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives every autonomous entity as its own recurring scheduler task:
/// perceive, decide, act, then return the delay until the next iteration.
/// No lock is held between iterations.
pub struct BehaviorLoop {
    registry: Arc<EntityRegistry>,
    scheduler: Arc<Scheduler>,
    broadcast: Arc<Broadcast>,
    combat: Arc<CombatResolution>,
    rule_book: Arc<RuleBook>,
    config: BehaviorConfig,
    rng: Mutex<GameRng>,
}

impl BehaviorLoop {
    pub fn new(
        registry: Arc<EntityRegistry>,
        scheduler: Arc<Scheduler>,
        broadcast: Arc<Broadcast>,
        combat: Arc<CombatResolution>,
        rule_book: Arc<RuleBook>,
        config: BehaviorConfig,
        rng: GameRng,
    ) -> Self {
        Self {
            registry,
            scheduler,
            broadcast,
            combat,
            rule_book,
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &BehaviorConfig {
        &self.config
    }

    /// Schedules the entity's loop. Starting an entity that already runs
    /// returns the existing task.
    pub fn start(self: &Arc<Self>, entity: &Arc<Entity>) -> Result<TaskId, SchedulerError> {
        if let Some(existing) = entity.behavior_task() {
            if self.scheduler.is_scheduled(existing) {
                return Ok(existing);
            }
        }
        let weak: Weak<BehaviorLoop> = Arc::downgrade(self);
        let target = Arc::clone(entity);
        let interval = entity.template.think_interval(self.config.think_interval);
        let task = self
            .scheduler
            .schedule_recurring(Some(TaskGroup::Map(entity.map)), interval, move || {
                match weak.upgrade() {
                    Some(behavior) => behavior.step(&target),
                    None => TaskStep::Finish,
                }
            })
            .map_err(|err| {
                logging::log_warn(&format!(
                    "behavior loop for entity {} on {} refused: {}",
                    entity.id.0, entity.map, err
                ));
                err
            })?;
        entity.set_behavior_task(Some(task));
        Ok(task)
    }

    /// Cancels the entity's loop or its pending respawn.
    pub fn stop(&self, id: EntityId) -> bool {
        let Some(entity) = self.registry.find_entity(id) else {
            logging::log_debug(&format!("stop for unknown entity {}", id.0));
            return false;
        };
        match entity.set_behavior_task(None) {
            Some(task) => self.scheduler.cancel(task),
            None => false,
        }
    }

    pub fn is_running(&self, entity: &Entity) -> bool {
        entity
            .behavior_task()
            .map(|task| self.scheduler.is_scheduled(task))
            .unwrap_or(false)
    }

    /// One bounded iteration. Returns when to run next.
    pub fn step(self: &Arc<Self>, entity: &Arc<Entity>) -> TaskStep {
        let started = Instant::now();
        if entity.is_invalidated() {
            entity.set_behavior_task(None);
            logging::log_debug(&format!("behavior loop of entity {} ended", entity.id.0));
            return TaskStep::Finish;
        }
        let snapshot = entity.snapshot();
        match snapshot.behavior {
            BehaviorState::Dead => {
                self.schedule_respawn(entity);
                return TaskStep::Finish;
            }
            BehaviorState::Respawning => return TaskStep::Finish,
            _ => {}
        }
        if !snapshot.alive {
            return TaskStep::Finish;
        }

        let rules = self.rule_book.rules_for(&entity.template);
        let plan = self.decide(entity, &snapshot, rules.as_ref(), started);
        self.act(entity, plan);

        let spent = started.elapsed();
        if spent > self.config.lag_budget {
            logging::log_lag(&format!(
                "behavior of entity {} on {} took {} ms",
                entity.id.0,
                entity.map,
                spent.as_millis()
            ));
        }
        TaskStep::Continue(entity.template.think_interval(self.config.think_interval))
    }

    fn decide(
        &self,
        entity: &Entity,
        snapshot: &EntityState,
        rules: &dyn BehaviorRules,
        now: Instant,
    ) -> Plan {
        let template = &entity.template;
        let position = snapshot.position;

        if let Some((target, target_position)) = self.perceive(entity, snapshot, rules) {
            if position.within(target_position, template.attack_range) {
                return Plan::Strike(target);
            }
            if template.is_stationary() {
                return Plan::Rest(BehaviorState::Idle);
            }
            // Stop at nine tenths of the attack range.
            let gap = (position.distance(target_position) - template.attack_range * 0.9).max(0.0);
            return Plan::MoveTo {
                destination: position.approach(target_position, self.step_length(entity).min(gap)),
                state: BehaviorState::Pursuing,
            };
        }

        if template.is_stationary() {
            return Plan::Rest(BehaviorState::Idle);
        }

        if let Some(leader) = rules.follow_target(entity) {
            if let Some(leader) = self.registry.character(leader) {
                let leader = leader.snapshot();
                if leader.map == entity.map && !position.within(leader.position, FOLLOW_DISTANCE) {
                    let gap = (position.distance(leader.position) - FOLLOW_DISTANCE).max(0.0);
                    return Plan::MoveTo {
                        destination: position
                            .approach(leader.position, self.step_length(entity).min(gap)),
                        state: BehaviorState::Roaming,
                    };
                }
            }
            return Plan::Rest(BehaviorState::Idle);
        }

        self.roam(entity, snapshot, now)
    }

    /// Keeps the current target while it stays within chase range, or
    /// picks the closest character that passes the template's rules.
    fn perceive(
        &self,
        entity: &Entity,
        snapshot: &EntityState,
        rules: &dyn BehaviorRules,
    ) -> Option<(CharacterId, Position)> {
        let template = &entity.template;
        let position = snapshot.position;

        if let Some(current) = snapshot.engaged {
            let kept = self.registry.character(current).and_then(|character| {
                let state = character.snapshot();
                let reachable = state.alive
                    && state.map == entity.map
                    && position.within(state.position, template.effective_chase_radius());
                reachable.then_some((current, state.position))
            });
            if kept.is_some() {
                return kept;
            }
            let mut state = entity.state();
            if state.engaged == Some(current) {
                state.engaged = None;
            }
        }

        if template.is_stationary() || template.aggro_radius <= 0.0 {
            return None;
        }
        let mut best: Option<(CharacterId, Position, f32)> = None;
        for character in
            self.registry
                .nearby_characters(entity.map, position, template.aggro_radius)
        {
            let state: CharacterState = character.snapshot();
            if !rules.should_aggro(entity, &state) {
                continue;
            }
            let distance = position.distance_squared(state.position);
            let closer = match best {
                None => true,
                Some((best_id, _, best_distance)) => {
                    distance < best_distance || (distance == best_distance && character.id < best_id)
                }
            };
            if closer {
                best = Some((character.id, state.position, distance));
            }
        }
        let (target, target_position, _) = best?;
        let mut state = entity.state();
        if !state.alive {
            return None;
        }
        state.engaged = Some(target);
        Some((target, target_position))
    }

    fn roam(&self, entity: &Entity, snapshot: &EntityState, now: Instant) -> Plan {
        let spawn = entity.spawn;
        if let Some(destination) = snapshot.roam_target {
            if snapshot.position.within(destination, 0.01) {
                let next = now + self.roam_pause();
                let mut state = entity.state();
                state.roam_target = None;
                state.next_roam_at = Some(next);
                return Plan::Rest(BehaviorState::Idle);
            }
            return Plan::MoveTo {
                destination: snapshot
                    .position
                    .approach(destination, self.step_length(entity)),
                state: BehaviorState::Roaming,
            };
        }
        if spawn.roam_radius <= 0.0 {
            return Plan::Rest(BehaviorState::Idle);
        }
        match snapshot.next_roam_at {
            Some(at) if at <= now => {
                let destination = {
                    let mut rng = lock(&self.rng);
                    let angle = rng.roll_unit() * std::f32::consts::TAU;
                    let reach = rng.roll_unit() * spawn.roam_radius;
                    Position::new(
                        spawn.position.x + angle.cos() * reach,
                        spawn.position.y + angle.sin() * reach,
                    )
                };
                {
                    let mut state = entity.state();
                    state.roam_target = Some(destination);
                    state.next_roam_at = None;
                }
                Plan::MoveTo {
                    destination: snapshot
                        .position
                        .approach(destination, self.step_length(entity)),
                    state: BehaviorState::Roaming,
                }
            }
            Some(_) => Plan::Rest(BehaviorState::Idle),
            None => {
                let next = now + self.roam_pause();
                entity.state().next_roam_at = Some(next);
                Plan::Rest(BehaviorState::Idle)
            }
        }
    }

    fn roam_pause(&self) -> Duration {
        let min = self.config.roam_interval_min.as_millis().min(u128::from(u32::MAX)) as u32;
        let max = self.config.roam_interval_max.as_millis().min(u128::from(u32::MAX)) as u32;
        Duration::from_millis(u64::from(lock(&self.rng).roll_range(min, max.max(min))))
    }

    fn step_length(&self, entity: &Entity) -> f32 {
        entity.template.speed
            * entity
                .template
                .think_interval(self.config.think_interval)
                .as_secs_f32()
    }

    fn act(self: &Arc<Self>, entity: &Arc<Entity>, plan: Plan) {
        match plan {
            Plan::Strike(target) => {
                {
                    let mut state = entity.state();
                    if !state.alive {
                        return;
                    }
                    state.behavior = BehaviorState::Attacking;
                }
                match self.combat.entity_attacks_character(entity, target) {
                    Ok(outcome) if outcome.died => {
                        let mut state = entity.state();
                        if state.engaged == Some(target) {
                            state.engaged = None;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        logging::log_debug(&format!(
                            "entity {} lost target {}: {}",
                            entity.id.0, target.0, err
                        ));
                        let mut state = entity.state();
                        if state.engaged == Some(target) {
                            state.engaged = None;
                        }
                    }
                }
            }
            Plan::MoveTo { destination, state } => self.move_entity(entity, destination, state),
            Plan::Rest(behavior) => {
                let mut state = entity.state();
                if state.alive {
                    state.behavior = behavior;
                }
            }
        }
    }

    fn move_entity(&self, entity: &Entity, destination: Position, behavior: BehaviorState) {
        let presentation_id = {
            let mut state = entity.state();
            if !state.alive {
                return;
            }
            state.behavior = behavior;
            if state.position == destination {
                return;
            }
            state.position = destination;
            state.last_step = Some(Instant::now());
            state.presentation_id
        };
        self.registry.reindex_entity(entity);
        if let Some(presentation_id) = presentation_id {
            self.broadcast.publish(Message::local(
                WorldEvent::EntityMove {
                    presentation_id,
                    position: destination,
                },
                Scope::NearObserversOf(Subject::Entity {
                    category: entity.category(),
                    id: entity.id,
                }),
            ));
        }
    }

    fn schedule_respawn(self: &Arc<Self>, entity: &Arc<Entity>) {
        {
            let mut state = entity.state();
            if state.behavior != BehaviorState::Dead {
                return;
            }
            state.behavior = BehaviorState::Respawning;
        }
        let delay = entity.template.respawn_delay(self.config.respawn_delay);
        self.queue_respawn(entity, delay);
    }

    fn queue_respawn(self: &Arc<Self>, entity: &Arc<Entity>, delay: Duration) {
        let weak: Weak<BehaviorLoop> = Arc::downgrade(self);
        let target = Arc::clone(entity);
        let scheduled = self.scheduler.schedule_once(
            Some(TaskGroup::Map(entity.map)),
            delay,
            move || {
                if let Some(behavior) = weak.upgrade() {
                    behavior.respawn(&target);
                }
            },
        );
        match scheduled {
            Ok(task) => {
                entity.set_behavior_task(Some(task));
            }
            Err(err) => {
                entity.set_behavior_task(None);
                logging::log_warn(&format!(
                    "respawn of entity {} on {} not scheduled: {}",
                    entity.id.0, entity.map, err
                ));
            }
        }
    }

    /// Brings a dead entity back at its spawn point as a new incarnation
    /// and restarts its loop. Returns false if there was nothing to do.
    pub fn respawn(self: &Arc<Self>, entity: &Arc<Entity>) -> bool {
        entity.set_behavior_task(None);
        if entity.is_invalidated() {
            return false;
        }
        {
            let mut state = entity.state();
            if state.alive || state.behavior != BehaviorState::Respawning {
                return false;
            }
            state.vitals.reset();
            state.position = entity.spawn.position;
            state.engaged = None;
            state.roam_target = None;
            state.next_roam_at = None;
            state.killer = None;
            state.last_step = None;
            state.generation = state.generation.wrapping_add(1);
        }
        match self.registry.assign_presentation_id(entity) {
            Ok(_) => {}
            Err(err @ SpawnError::Capacity { .. }) => {
                logging::log_warn(&format!(
                    "respawn of entity {} delayed: {}",
                    entity.id.0, err
                ));
                let delay = entity.template.respawn_delay(self.config.respawn_delay);
                self.queue_respawn(entity, delay);
                return false;
            }
            Err(err) => {
                logging::log_debug(&format!("respawn of entity {} dropped: {}", entity.id.0, err));
                return false;
            }
        }
        {
            let mut state = entity.state();
            state.alive = true;
            state.behavior = BehaviorState::Idle;
        }
        self.registry.reindex_entity(entity);
        logging::log_debug(&format!(
            "{} ({}) respawned on {}",
            entity.template.name, entity.id.0, entity.map
        ));
        self.start(entity).is_ok()
    }
}
