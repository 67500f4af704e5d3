use crate::combat::conditions::{ConditionInstance, ConditionKind, ConditionSpec};
use crate::combat::damage::{compute_damage, AttackProfile, DefenseProfile};
use crate::combat::loot::roll_loot;
use crate::combat::queue::PendingHit;
use crate::combat::rules::CombatRules;
use crate::entities::character::{Character, CharacterState};
use crate::entities::creature::{
    AttackerRef, CharacterId, EntityId, MapKey, PresentationId, TargetRef,
};
use crate::entities::drop::{Claim, ItemDrop};
use crate::entities::entity::{BehaviorState, Entity};
use crate::entities::template::{EntityTemplate, KillEffect};
use crate::net::broadcast::Broadcast;
use crate::net::events::{Message, Scope, Subject, WorldEvent};
use crate::persistence::journal::{KillRecord, PvpKill, WorldJournal};
use crate::runtime::rng::GameRng;
use crate::runtime::scheduler::{Scheduler, SchedulerError, TaskGroup, TaskStep};
use crate::telemetry::logging;
use crate::world::behavior_rules::RuleBook;
use crate::world::observer::Category;
use crate::world::position::Position;
use crate::world::registry::EntityRegistry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombatError {
    StaleAttacker,
    StaleTarget,
    OutOfRange,
    TargetDead,
    MapMismatch,
    PvpDisabled,
    Scheduler(SchedulerError),
}

impl fmt::Display for CombatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CombatError::Scheduler(err) => return write!(f, "deferred action refused: {}", err),
            CombatError::StaleAttacker => "attacker no longer exists",
            CombatError::StaleTarget => "target no longer exists",
            CombatError::OutOfRange => "target out of range",
            CombatError::TargetDead => "target is dead",
            CombatError::MapMismatch => "target is on another map",
            CombatError::PvpDisabled => "player combat is disabled",
        };
        f.write_str(text)
    }
}

impl std::error::Error for CombatError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageOutcome {
    pub new_health: u32,
    pub died: bool,
    pub applied: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitResult {
    pub attacker: CharacterId,
    pub hit: PendingHit,
    pub outcome: Result<DamageOutcome, CombatError>,
}

/// Snapshot of a target taken while validating an attack.
#[derive(Debug, Clone, Copy)]
struct TargetView {
    map: MapKey,
    position: Position,
    defense: u32,
    level: u16,
    health: u32,
}

type ConditionSlot = Arc<Mutex<ConditionInstance>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Applies damage to shared health state. Each target's health is only
/// touched under that target's own lock, so concurrent hits serialize per
/// target and unrelated fights never contend.
pub struct CombatResolution {
    registry: Arc<EntityRegistry>,
    broadcast: Arc<Broadcast>,
    scheduler: Arc<Scheduler>,
    journal: Arc<dyn WorldJournal>,
    rules: CombatRules,
    rule_book: Arc<RuleBook>,
    rng: Mutex<GameRng>,
    conditions: Mutex<HashMap<(TargetRef, ConditionKind), ConditionSlot>>,
}

impl CombatResolution {
    pub fn new(
        registry: Arc<EntityRegistry>,
        broadcast: Arc<Broadcast>,
        scheduler: Arc<Scheduler>,
        journal: Arc<dyn WorldJournal>,
        rules: CombatRules,
        rule_book: Arc<RuleBook>,
        rng: GameRng,
    ) -> Self {
        Self {
            registry,
            broadcast,
            scheduler,
            journal,
            rules,
            rule_book,
            rng: Mutex::new(rng),
            conditions: Mutex::new(HashMap::new()),
        }
    }

    pub fn rules(&self) -> &CombatRules {
        &self.rules
    }

    /// Decrements the target's health and runs death handling exactly once
    /// for the call that takes it to zero. Hitting something already dead
    /// is a no-op reported as `{ new_health: 0, died: false }`.
    pub fn apply_damage(
        self: &Arc<Self>,
        attacker: AttackerRef,
        target: TargetRef,
        amount: u32,
    ) -> Result<DamageOutcome, CombatError> {
        match target {
            TargetRef::Entity(id) => self.damage_entity(attacker, id, amount),
            TargetRef::Character(id) => self.damage_character(attacker, id, amount),
        }
    }

    fn damage_entity(
        self: &Arc<Self>,
        attacker: AttackerRef,
        id: EntityId,
        amount: u32,
    ) -> Result<DamageOutcome, CombatError> {
        let Some(entity) = self.registry.find_entity(id) else {
            logging::log_debug(&format!("damage to unknown entity {} dropped", id.0));
            return Err(CombatError::StaleTarget);
        };
        let Some(partition) = self.registry.partition(entity.map) else {
            logging::log_debug(&format!("damage to entity {} on detached map dropped", id.0));
            return Err(CombatError::StaleTarget);
        };
        let retaliate = attacker.character().filter(|character| {
            self.rule_book
                .rules_for(&entity.template)
                .retaliates(&entity, *character)
        });

        let (outcome, presentation_id, position, health_percent) = {
            let mut state = entity.state();
            if !state.alive {
                logging::log_debug(&format!("damage to dead entity {} ignored", id.0));
                return Ok(DamageOutcome {
                    new_health: 0,
                    died: false,
                    applied: 0,
                });
            }
            let applied = state.vitals.apply_raw_damage(amount);
            let presentation_id = state.presentation_id;
            if state.engaged.is_none() {
                state.engaged = retaliate;
            }
            let died = state.vitals.is_depleted();
            if died {
                state.alive = false;
                state.behavior = BehaviorState::Dead;
                state.engaged = None;
                state.roam_target = None;
                state.killer = Some(attacker);
                if let Some(retired) = state.presentation_id.take() {
                    partition.retire(retired);
                }
            }
            (
                DamageOutcome {
                    new_health: state.vitals.health,
                    died,
                    applied,
                },
                presentation_id,
                state.position,
                state.vitals.percent(),
            )
        };

        let subject = Subject::Entity {
            category: entity.category(),
            id,
        };
        if let Some(presentation_id) = presentation_id {
            if outcome.applied > 0 {
                self.broadcast.publish(Message::local(
                    WorldEvent::EntityDamaged {
                        presentation_id,
                        amount: outcome.applied,
                        health_percent,
                    },
                    Scope::NearObserversOf(subject),
                ));
            }
        }
        if outcome.died {
            self.on_entity_death(&entity, attacker, presentation_id, position);
        }
        Ok(outcome)
    }

    fn damage_character(
        self: &Arc<Self>,
        attacker: AttackerRef,
        id: CharacterId,
        amount: u32,
    ) -> Result<DamageOutcome, CombatError> {
        let Some(victim) = self.registry.character(id) else {
            logging::log_debug(&format!("damage to unknown character {} dropped", id.0));
            return Err(CombatError::StaleTarget);
        };
        let (outcome, health_percent) = {
            let mut state = victim.state();
            if !state.alive {
                logging::log_debug(&format!("damage to dead character {} ignored", id.0));
                return Ok(DamageOutcome {
                    new_health: 0,
                    died: false,
                    applied: 0,
                });
            }
            let applied = state.vitals.apply_raw_damage(amount);
            let died = state.vitals.is_depleted();
            if died {
                state.alive = false;
            }
            (
                DamageOutcome {
                    new_health: state.vitals.health,
                    died,
                    applied,
                },
                state.vitals.percent(),
            )
        };
        if outcome.applied > 0 {
            self.broadcast.publish(Message::local(
                WorldEvent::CharacterDamaged {
                    character: id,
                    amount: outcome.applied,
                    health_percent,
                },
                Scope::NearObserversOf(Subject::Character(id)),
            ));
        }
        if outcome.died {
            self.on_character_death(&victim, attacker);
        }
        Ok(outcome)
    }

    /// Pets hand their kills to their owner.
    fn credit_for(&self, attacker: AttackerRef) -> Option<CharacterId> {
        match attacker {
            AttackerRef::Character(id) => Some(id),
            AttackerRef::Entity(id) => self.registry.find_entity(id).and_then(|pet| pet.owner),
            AttackerRef::Environment => None,
        }
    }

    fn on_entity_death(
        self: &Arc<Self>,
        entity: &Arc<Entity>,
        attacker: AttackerRef,
        presentation_id: Option<PresentationId>,
        position: Position,
    ) {
        let killer = self.credit_for(attacker);
        let loot = roll_loot(&entity.template.loot, &mut lock(&self.rng));
        let now = Instant::now();
        let mut drops = 0;
        for payload in loot {
            let claim = killer.map(|owner| Claim {
                owner,
                until: now + self.rules.claim_duration,
            });
            let drop = ItemDrop::new(
                self.registry.allocate_entity_id(),
                entity.map,
                position,
                payload,
                claim,
            );
            match self.registry.insert_drop(drop) {
                Ok(drop) => {
                    drops += 1;
                    self.schedule_drop_expiry(drop.map, drop.id);
                }
                Err(err) => logging::log_warn(&format!(
                    "loot of entity {} not placed: {}",
                    entity.id.0, err
                )),
            }
        }

        if let Some(presentation_id) = presentation_id {
            self.broadcast.publish(Message::local(
                WorldEvent::EntityDied { presentation_id },
                Scope::NearObserversOf(Subject::Entity {
                    category: entity.category(),
                    id: entity.id,
                }),
            ));
        }

        let experience = entity.template.experience;
        if let Some(character) = killer.and_then(|id| self.registry.character(id)) {
            character.state().experience += u64::from(experience);
            self.broadcast.publish(Message::cluster(
                WorldEvent::KillCredit {
                    killer: character.id,
                    experience,
                },
                Scope::NearObserversOf(Subject::Character(character.id)),
            ));
            self.apply_kill_effect(&character, &entity.template);
        }

        self.journal.record_kill(&KillRecord {
            killer,
            entity: entity.id,
            template: entity.template.id,
            map: entity.map,
            experience,
            drops,
        });
        logging::log_game(&format!(
            "{} ({}) died on {}, killer {:?}, {} drops",
            entity.template.name, entity.id.0, entity.map, killer, drops
        ));
    }

    fn apply_kill_effect(self: &Arc<Self>, killer: &Character, template: &EntityTemplate) {
        match &template.kill_effect {
            Some(KillEffect::Heal { amount }) => {
                let mut state = killer.state();
                if state.alive {
                    state.vitals.apply_heal(*amount);
                }
            }
            Some(KillEffect::Condition(spec)) => {
                if let Err(err) = self.apply_condition(
                    TargetRef::Character(killer.id),
                    *spec,
                    AttackerRef::Environment,
                ) {
                    logging::log_debug(&format!(
                        "kill effect on character {} skipped: {}",
                        killer.id.0, err
                    ));
                }
            }
            None => {}
        }
    }

    fn on_character_death(&self, victim: &Character, attacker: AttackerRef) {
        self.broadcast.publish(Message::local(
            WorldEvent::CharacterDied {
                character: victim.id,
            },
            Scope::NearObserversOf(Subject::Character(victim.id)),
        ));
        let map = victim.map();
        let killer = self.credit_for(attacker).filter(|id| *id != victim.id);
        let player_kill = matches!(attacker, AttackerRef::Character(_));
        if let (Some(killer_id), true, true) = (killer, player_kill, self.rules.pvp_enabled) {
            if let Some(killer) = self.registry.character(killer_id) {
                {
                    let mut state = killer.state();
                    state.pvp.kills += 1;
                    state.pvp.infamy += 1;
                }
                victim.state().pvp.deaths += 1;
                self.journal.record_pvp(&PvpKill {
                    killer: killer_id,
                    victim: victim.id,
                    map,
                });
            }
        }
        logging::log_game(&format!(
            "character {} ({}) died on {}, attacker {:?}",
            victim.name, victim.id.0, map, attacker
        ));
    }

    fn schedule_drop_expiry(&self, map: MapKey, id: EntityId) {
        let registry = Arc::clone(&self.registry);
        let scheduled = self.scheduler.schedule_once(
            Some(TaskGroup::Map(map)),
            self.rules.drop_expiry,
            move || {
                if registry.remove_drop(map, id).is_some() {
                    logging::log_debug(&format!("drop {} on {} expired", id.0, map));
                }
            },
        );
        if let Err(err) = scheduled {
            logging::log_warn(&format!("expiry for drop {} not scheduled: {}", id.0, err));
        }
    }

    fn inspect_target(&self, target: TargetRef) -> Result<TargetView, CombatError> {
        match target {
            TargetRef::Entity(id) => {
                let entity = self
                    .registry
                    .find_entity(id)
                    .ok_or(CombatError::StaleTarget)?;
                let state = entity.state();
                if !state.alive {
                    return Err(CombatError::TargetDead);
                }
                Ok(TargetView {
                    map: entity.map,
                    position: state.position,
                    defense: entity.template.defense,
                    level: entity.template.level,
                    health: state.vitals.health,
                })
            }
            TargetRef::Character(id) => {
                let character = self
                    .registry
                    .character(id)
                    .ok_or(CombatError::StaleTarget)?;
                let state = character.state();
                if !state.alive {
                    return Err(CombatError::TargetDead);
                }
                Ok(TargetView {
                    map: state.map,
                    position: state.position,
                    defense: state.profile.defense,
                    level: state.profile.level,
                    health: state.vitals.health,
                })
            }
        }
    }

    /// Validates a character's attack and rolls its damage without applying it.
    fn roll_attack(
        &self,
        attacker: CharacterId,
        target: TargetRef,
        range: f32,
    ) -> Result<(Arc<Character>, TargetView, u32), CombatError> {
        let character = self
            .registry
            .character(attacker)
            .ok_or(CombatError::StaleAttacker)?;
        let state = character.snapshot();
        if !state.alive {
            return Err(CombatError::StaleAttacker);
        }
        if let TargetRef::Character(victim) = target {
            if !self.rules.pvp_enabled || victim == attacker {
                return Err(CombatError::PvpDisabled);
            }
        }
        let view = self.inspect_target(target)?;
        if view.map != state.map {
            return Err(CombatError::MapMismatch);
        }
        if !state.position.within(view.position, range) {
            return Err(CombatError::OutOfRange);
        }
        let damage = self.roll_against(&state, &view);
        Ok((character, view, damage))
    }

    fn roll_against(&self, attacker: &CharacterState, view: &TargetView) -> u32 {
        compute_damage(
            AttackProfile {
                min_damage: attacker.profile.min_damage,
                max_damage: attacker.profile.max_damage,
                level: attacker.profile.level,
            },
            DefenseProfile {
                defense: view.defense,
                level: view.level,
                remaining_health: view.health,
            },
            self.rules.damage_rule,
            &mut lock(&self.rng),
        )
    }

    /// Direct attack: validates, computes damage and queues the hit on the
    /// attacker's combat queue.
    pub fn declare_attack(
        &self,
        attacker: CharacterId,
        target: TargetRef,
    ) -> Result<PendingHit, CombatError> {
        let (character, _, damage) = self.roll_attack(attacker, target, self.rules.melee_range)?;
        let hit = character.queue().push(target, damage);
        Ok(hit)
    }

    /// Queues damage computed elsewhere, e.g. by a skill table.
    pub fn enqueue_hit(
        &self,
        attacker: CharacterId,
        target: TargetRef,
        damage: u32,
    ) -> Result<PendingHit, CombatError> {
        let character = self
            .registry
            .character(attacker)
            .ok_or(CombatError::StaleAttacker)?;
        let hit = character.queue().push(target, damage);
        Ok(hit)
    }

    pub fn flush_attacks(self: &Arc<Self>, attacker: CharacterId) -> Vec<HitResult> {
        self.flush_round(&[attacker])
    }

    /// Applies every queued hit of the given attackers in declaration order,
    /// so when several hits could finish a target the earliest-enqueued one
    /// that crosses zero gets the kill. Queues are empty afterwards.
    pub fn flush_round(self: &Arc<Self>, attackers: &[CharacterId]) -> Vec<HitResult> {
        let mut pending: Vec<(CharacterId, PendingHit)> = Vec::new();
        for attacker in attackers {
            if let Some(character) = self.registry.character(*attacker) {
                pending.extend(
                    character
                        .queue()
                        .drain_ordered()
                        .into_iter()
                        .map(|hit| (*attacker, hit)),
                );
            }
        }
        pending.sort_by_key(|(_, hit)| hit.sequence);
        pending
            .into_iter()
            .map(|(attacker, hit)| HitResult {
                attacker,
                hit,
                outcome: self.apply_damage(AttackerRef::Character(attacker), hit.target, hit.damage),
            })
            .collect()
    }

    /// Synchronous attack path: declare then apply immediately.
    pub fn attack(
        self: &Arc<Self>,
        attacker: CharacterId,
        target: TargetRef,
    ) -> Result<DamageOutcome, CombatError> {
        self.declare_attack(attacker, target)?;
        self.flush_attacks(attacker)
            .into_iter()
            .filter(|result| result.hit.target == target)
            .last()
            .map(|result| result.outcome)
            .unwrap_or(Err(CombatError::StaleTarget))
    }

    /// Multi-hit skill: every hit's damage is rolled now and applied by a
    /// one-shot after its delay.
    pub fn declare_deferred(
        self: &Arc<Self>,
        attacker: CharacterId,
        target: TargetRef,
        delays: &[Duration],
        range: f32,
    ) -> Result<usize, CombatError> {
        let (character, view, first) = self.roll_attack(attacker, target, range)?;
        let state = character.snapshot();
        let mut scheduled = 0;
        for (index, delay) in delays.iter().enumerate() {
            let damage = if index == 0 {
                first
            } else {
                self.roll_against(&state, &view)
            };
            let weak = Arc::downgrade(self);
            let result = self.scheduler.schedule_once(
                Some(TaskGroup::Map(view.map)),
                *delay,
                move || {
                    if let Some(combat) = weak.upgrade() {
                        let _ = combat.apply_damage(AttackerRef::Character(attacker), target, damage);
                    }
                },
            );
            match result {
                Ok(_) => scheduled += 1,
                Err(err) => logging::log_warn(&format!(
                    "deferred hit of character {} dropped: {}",
                    attacker.0, err
                )),
            }
        }
        Ok(scheduled)
    }

    /// Area effect: damage for every living monster in the radius is rolled
    /// at declaration and applied together after `delay`.
    pub fn area_attack(
        self: &Arc<Self>,
        attacker: CharacterId,
        center: Position,
        radius: f32,
        delay: Duration,
    ) -> Result<usize, CombatError> {
        let character = self
            .registry
            .character(attacker)
            .ok_or(CombatError::StaleAttacker)?;
        let state = character.snapshot();
        if !state.alive {
            return Err(CombatError::StaleAttacker);
        }
        let mut hits = Vec::new();
        for entity in self
            .registry
            .nearby_entities(state.map, center, radius, Some(Category::Monsters))
        {
            let health = {
                let entity_state = entity.state();
                if !entity_state.alive {
                    continue;
                }
                entity_state.vitals.health
            };
            let damage = compute_damage(
                AttackProfile {
                    min_damage: state.profile.min_damage,
                    max_damage: state.profile.max_damage,
                    level: state.profile.level,
                },
                DefenseProfile {
                    defense: entity.template.defense,
                    level: entity.template.level,
                    remaining_health: health,
                },
                self.rules.damage_rule,
                &mut lock(&self.rng),
            );
            hits.push((TargetRef::Entity(entity.id), damage));
        }
        let count = hits.len();
        if count == 0 {
            return Ok(0);
        }
        let weak = Arc::downgrade(self);
        self.scheduler
            .schedule_once(Some(TaskGroup::Map(state.map)), delay, move || {
                if let Some(combat) = weak.upgrade() {
                    for (target, damage) in hits {
                        let _ = combat.apply_damage(AttackerRef::Character(attacker), target, damage);
                    }
                }
            })
            .map_err(|err| {
                logging::log_warn(&format!("area effect of character {} dropped: {}", attacker.0, err));
                CombatError::Scheduler(err)
            })?;
        Ok(count)
    }

    /// Monster melee against a character, driven by the behavior loop.
    pub fn entity_attacks_character(
        self: &Arc<Self>,
        entity: &Entity,
        target: CharacterId,
    ) -> Result<DamageOutcome, CombatError> {
        let view = self.inspect_target(TargetRef::Character(target))?;
        let damage = compute_damage(
            AttackProfile {
                min_damage: entity.template.min_damage,
                max_damage: entity.template.max_damage,
                level: entity.template.level,
            },
            DefenseProfile {
                defense: view.defense,
                level: view.level,
                remaining_health: view.health,
            },
            self.rules.damage_rule,
            &mut lock(&self.rng),
        );
        self.apply_damage(AttackerRef::Entity(entity.id), TargetRef::Character(target), damage)
    }

    /// Starts a periodic effect, or strengthens the running one of the same
    /// kind on the same target.
    pub fn apply_condition(
        self: &Arc<Self>,
        target: TargetRef,
        spec: ConditionSpec,
        source: AttackerRef,
    ) -> Result<(), CombatError> {
        let view = self.inspect_target(target)?;
        let instance = ConditionInstance::new(spec);
        let key = (target, spec.kind);
        let slot = {
            let mut active = lock(&self.conditions);
            if let Some(existing) = active.get(&key) {
                lock(existing).merge_from(instance);
                return Ok(());
            }
            let slot = Arc::new(Mutex::new(instance));
            active.insert(key, Arc::clone(&slot));
            slot
        };
        let weak: Weak<CombatResolution> = Arc::downgrade(self);
        let scheduled = self.scheduler.schedule_recurring(
            Some(TaskGroup::Map(view.map)),
            instance.interval,
            move || match weak.upgrade() {
                Some(combat) => combat.condition_tick(key, &slot, source),
                None => TaskStep::Finish,
            },
        );
        if let Err(err) = scheduled {
            lock(&self.conditions).remove(&key);
            logging::log_warn(&format!("condition on {:?} not scheduled: {}", target, err));
        }
        Ok(())
    }

    fn condition_tick(
        self: &Arc<Self>,
        key: (TargetRef, ConditionKind),
        slot: &ConditionSlot,
        source: AttackerRef,
    ) -> TaskStep {
        let (target, kind) = key;
        let tick = {
            let mut active = lock(&self.conditions);
            let mut instance = lock(slot);
            let tick = instance.next_tick().map(|amount| (amount, instance.interval));
            drop(instance);
            if tick.is_none() {
                active.remove(&key);
            }
            tick
        };
        let Some((amount, interval)) = tick else {
            return TaskStep::Finish;
        };
        let keep_going = if kind.heals() {
            self.heal(target, amount).is_ok()
        } else {
            matches!(
                self.apply_damage(source, target, amount),
                Ok(outcome) if !outcome.died
            )
        };
        if keep_going && self.inspect_target(target).is_ok() {
            TaskStep::Continue(interval)
        } else {
            lock(&self.conditions).remove(&key);
            TaskStep::Finish
        }
    }

    pub fn active_conditions(&self, target: TargetRef) -> Vec<ConditionKind> {
        lock(&self.conditions)
            .keys()
            .filter(|(key_target, _)| *key_target == target)
            .map(|(_, kind)| *kind)
            .collect()
    }

    pub fn heal(&self, target: TargetRef, amount: u32) -> Result<u32, CombatError> {
        match target {
            TargetRef::Entity(id) => {
                let entity = self
                    .registry
                    .find_entity(id)
                    .ok_or(CombatError::StaleTarget)?;
                let mut state = entity.state();
                if !state.alive {
                    return Err(CombatError::TargetDead);
                }
                Ok(state.vitals.apply_heal(amount))
            }
            TargetRef::Character(id) => {
                let character = self
                    .registry
                    .character(id)
                    .ok_or(CombatError::StaleTarget)?;
                let mut state = character.state();
                if !state.alive {
                    return Err(CombatError::TargetDead);
                }
                Ok(state.vitals.apply_heal(amount))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::combat::conditions::ConditionKind;
    use crate::entities::character::CharacterProfile;
    use crate::entities::creature::FactionId;
    use crate::entities::entity::SpawnPoint;
    use crate::entities::template::{test_template, LootEntry};
    use crate::net::codec::PacketEncoder;
    use crate::persistence::journal::MemoryJournal;
    use crate::world::registry::RegistryConfig;
    use std::sync::Barrier;
    use std::thread;

    pub(crate) const MAP: MapKey = MapKey::new(1, 1);

    pub(crate) struct Arena {
        pub registry: Arc<EntityRegistry>,
        pub broadcast: Arc<Broadcast>,
        pub scheduler: Arc<Scheduler>,
        pub journal: Arc<MemoryJournal>,
        pub combat: Arc<CombatResolution>,
    }

    impl Arena {
        pub fn new() -> Self {
            Self::with_rules(CombatRules::default())
        }

        pub fn with_rules(rules: CombatRules) -> Self {
            let registry = Arc::new(EntityRegistry::new(RegistryConfig {
                sector_size: 8.0,
                presentation_capacity: 1024,
            }));
            registry.ensure_map(MAP);
            let broadcast = Arc::new(Broadcast::new(
                1,
                Arc::new(PacketEncoder),
                registry.clone(),
                64,
            ));
            let scheduler = Arc::new(Scheduler::manual(1024));
            let journal = Arc::new(MemoryJournal::new());
            let combat = Arc::new(CombatResolution::new(
                Arc::clone(&registry),
                Arc::clone(&broadcast),
                Arc::clone(&scheduler),
                journal.clone(),
                rules,
                Arc::new(RuleBook::new()),
                GameRng::from_seed(5),
            ));
            Self {
                registry,
                broadcast,
                scheduler,
                journal,
                combat,
            }
        }

        pub fn monster(&self, template: EntityTemplate, x: f32, y: f32) -> Arc<Entity> {
            self.registry
                .insert(Entity::new(
                    self.registry.allocate_entity_id(),
                    MAP,
                    Arc::new(template),
                    SpawnPoint {
                        position: Position::new(x, y),
                        roam_radius: 0.0,
                    },
                    None,
                ))
                .expect("monster")
        }

        pub fn character(&self, id: u32, x: f32, y: f32) -> Arc<Character> {
            self.registry
                .add_character(Character::new(
                    CharacterId(id),
                    format!("hero{}", id),
                    MAP,
                    Position::new(x, y),
                    CharacterProfile {
                        level: 10,
                        max_health: 200,
                        min_damage: 10,
                        max_damage: 10,
                        defense: 0,
                        faction: FactionId(1),
                    },
                ))
                .expect("character")
        }
    }

    #[test]
    fn concurrent_damage_never_loses_or_doubles_hits() {
        let arena = Arena::new();
        let mut template = test_template(1);
        template.base_hp = 1000;
        let entity = arena.monster(template, 0.0, 0.0);
        let amounts: Vec<u32> = (1..=16).collect();
        let barrier = Barrier::new(amounts.len());
        thread::scope(|scope| {
            for amount in &amounts {
                let combat = &arena.combat;
                let barrier = &barrier;
                let target = TargetRef::Entity(entity.id);
                scope.spawn(move || {
                    barrier.wait();
                    combat
                        .apply_damage(AttackerRef::Environment, target, *amount)
                        .expect("damage");
                });
            }
        });
        let total: u32 = amounts.iter().sum();
        assert_eq!(entity.snapshot().vitals.health, 1000 - total);
        assert!(entity.is_alive());
    }

    #[test]
    fn overlapping_lethal_hits_kill_exactly_once() {
        let arena = Arena::new();
        let entity = arena.monster(test_template(1), 0.0, 0.0);
        for id in 1..=8 {
            arena.character(id, 0.0, 0.0);
        }
        let barrier = Barrier::new(8);
        let deaths: usize = thread::scope(|scope| {
            let handles: Vec<_> = (1..=8)
                .map(|id| {
                    let combat = &arena.combat;
                    let barrier = &barrier;
                    let target = TargetRef::Entity(entity.id);
                    scope.spawn(move || {
                        barrier.wait();
                        combat
                            .apply_damage(AttackerRef::Character(CharacterId(id)), target, 60)
                            .map(|outcome| outcome.died as usize)
                            .unwrap_or(0)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("hitter")).sum()
        });
        assert_eq!(deaths, 1);
        let state = entity.snapshot();
        assert_eq!(state.vitals.health, 0);
        assert!(!state.alive);
        assert_eq!(state.behavior, BehaviorState::Dead);
        assert_eq!(arena.journal.kills().len(), 1);
    }

    #[test]
    fn earliest_enqueued_crossing_hit_gets_the_kill() {
        let arena = Arena::new();
        let entity = arena.monster(test_template(1), 0.0, 0.0);
        arena.character(1, 0.0, 0.0);
        arena.character(2, 0.0, 0.0);
        let target = TargetRef::Entity(entity.id);
        arena.combat.enqueue_hit(CharacterId(1), target, 40).expect("first");
        arena.combat.enqueue_hit(CharacterId(2), target, 70).expect("second");

        let results = arena.combat.flush_round(&[CharacterId(2), CharacterId(1)]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].attacker, CharacterId(1));
        assert_eq!(
            results[0].outcome,
            Ok(DamageOutcome {
                new_health: 60,
                died: false,
                applied: 40
            })
        );
        assert_eq!(
            results[1].outcome,
            Ok(DamageOutcome {
                new_health: 0,
                died: true,
                applied: 60
            })
        );
        let kills = arena.journal.kills();
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].killer, Some(CharacterId(2)));
        assert_eq!(
            arena.registry.character(CharacterId(2)).expect("c2").snapshot().experience,
            50
        );
        assert!(arena.registry.character(CharacterId(1)).expect("c1").queue().is_empty());
    }

    #[test]
    fn dead_target_takes_nothing() {
        let arena = Arena::new();
        let entity = arena.monster(test_template(1), 0.0, 0.0);
        let target = TargetRef::Entity(entity.id);
        let first = arena
            .combat
            .apply_damage(AttackerRef::Environment, target, 500)
            .expect("lethal");
        assert!(first.died);
        let second = arena
            .combat
            .apply_damage(AttackerRef::Environment, target, 5)
            .expect("dead");
        assert_eq!(
            second,
            DamageOutcome {
                new_health: 0,
                died: false,
                applied: 0
            }
        );
        assert_eq!(
            arena.combat.apply_damage(AttackerRef::Environment, TargetRef::Entity(EntityId(999)), 1),
            Err(CombatError::StaleTarget)
        );
    }

    #[test]
    fn death_drops_claimed_loot_and_retires_the_id() {
        let arena = Arena::new();
        let mut template = test_template(1);
        template.loot = vec![LootEntry {
            item: 3031,
            count_min: 3,
            count_max: 3,
            chance: 1000,
        }];
        let entity = arena.monster(template, 2.0, 2.0);
        arena.character(1, 2.0, 2.0);
        let partition = arena.registry.partition(MAP).expect("map");
        assert_eq!(partition.presentation_ids_in_use(), 1);

        arena
            .combat
            .apply_damage(
                AttackerRef::Character(CharacterId(1)),
                TargetRef::Entity(entity.id),
                100,
            )
            .expect("kill");
        assert_eq!(entity.presentation_id(), None);
        let drops = arena.registry.nearby_drops(MAP, Position::new(2.0, 2.0), 0.5);
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].payload.count, 3);
        assert_eq!(drops[0].active_claim(Instant::now()), Some(CharacterId(1)));
        // The monster's id went back to the pool and the drop got the lowest one.
        assert_eq!(partition.presentation_ids_in_use(), 1);
        assert_eq!(arena.journal.kills()[0].drops, 1);

        arena
            .scheduler
            .run_due(Instant::now() + Duration::from_secs(61));
        assert!(arena.registry.nearby_drops(MAP, Position::new(2.0, 2.0), 0.5).is_empty());
        assert_eq!(partition.presentation_ids_in_use(), 0);
    }

    #[test]
    fn declare_attack_validates_before_queueing() {
        let arena = Arena::new();
        let entity = arena.monster(test_template(1), 0.0, 0.0);
        let far = arena.monster(test_template(1), 30.0, 0.0);
        arena.character(1, 1.0, 0.0);

        let hit = arena
            .combat
            .declare_attack(CharacterId(1), TargetRef::Entity(entity.id))
            .expect("hit");
        assert_eq!(hit.damage, 10);
        assert_eq!(
            arena
                .combat
                .declare_attack(CharacterId(1), TargetRef::Entity(far.id)),
            Err(CombatError::OutOfRange)
        );
        assert_eq!(
            arena
                .combat
                .declare_attack(CharacterId(9), TargetRef::Entity(entity.id)),
            Err(CombatError::StaleAttacker)
        );
        let results = arena.combat.flush_attacks(CharacterId(1));
        assert_eq!(results.len(), 1);
        assert_eq!(entity.snapshot().vitals.health, 90);
        assert_eq!(entity.snapshot().engaged, Some(CharacterId(1)));
    }

    #[test]
    fn pvp_kill_updates_both_records() {
        let arena = Arena::new();
        arena.character(1, 0.0, 0.0);
        let victim = arena.character(2, 1.0, 0.0);
        let outcome = arena
            .combat
            .apply_damage(
                AttackerRef::Character(CharacterId(1)),
                TargetRef::Character(CharacterId(2)),
                500,
            )
            .expect("kill");
        assert!(outcome.died);
        let killer = arena.registry.character(CharacterId(1)).expect("killer").snapshot();
        assert_eq!(killer.pvp.kills, 1);
        assert_eq!(killer.pvp.infamy, 1);
        assert_eq!(victim.snapshot().pvp.deaths, 1);
        assert_eq!(arena.journal.pvp().len(), 1);
    }

    #[test]
    fn pvp_can_be_disabled() {
        let arena = Arena::with_rules(CombatRules {
            pvp_enabled: false,
            ..CombatRules::default()
        });
        arena.character(1, 0.0, 0.0);
        arena.character(2, 1.0, 0.0);
        assert_eq!(
            arena
                .combat
                .declare_attack(CharacterId(1), TargetRef::Character(CharacterId(2))),
            Err(CombatError::PvpDisabled)
        );
    }

    #[test]
    fn deferred_and_area_hits_apply_later() {
        let arena = Arena::new();
        let first = arena.monster(test_template(1), 0.0, 0.0);
        let second = arena.monster(test_template(1), 1.0, 1.0);
        let outside = arena.monster(test_template(1), 9.0, 9.0);
        arena.character(1, 0.5, 0.5);

        let count = arena
            .combat
            .area_attack(CharacterId(1), Position::new(0.5, 0.5), 2.0, Duration::from_millis(500))
            .expect("area");
        assert_eq!(count, 2);
        let scheduled = arena
            .combat
            .declare_deferred(
                CharacterId(1),
                TargetRef::Entity(first.id),
                &[Duration::from_millis(100), Duration::from_millis(200)],
                3.0,
            )
            .expect("deferred");
        assert_eq!(scheduled, 2);
        assert_eq!(first.snapshot().vitals.health, 100);

        arena.scheduler.run_due(Instant::now() + Duration::from_secs(1));
        assert_eq!(first.snapshot().vitals.health, 70);
        assert_eq!(second.snapshot().vitals.health, 90);
        assert_eq!(outside.snapshot().vitals.health, 100);
    }

    #[test]
    fn periodic_condition_ticks_and_merges() {
        let arena = Arena::new();
        let entity = arena.monster(test_template(1), 0.0, 0.0);
        let target = TargetRef::Entity(entity.id);
        let poison = ConditionSpec {
            kind: ConditionKind::Poison,
            tick_amount: 5,
            interval_ms: 100,
            ticks: 2,
        };
        arena
            .combat
            .apply_condition(target, poison, AttackerRef::Environment)
            .expect("condition");
        arena
            .combat
            .apply_condition(target, ConditionSpec { ticks: 3, ..poison }, AttackerRef::Environment)
            .expect("merge");
        assert_eq!(arena.combat.active_conditions(target), vec![ConditionKind::Poison]);

        let start = Instant::now();
        for step in 1..=4 {
            arena
                .scheduler
                .run_due(start + Duration::from_millis(150 * step));
        }
        assert_eq!(entity.snapshot().vitals.health, 85);
        assert!(arena.combat.active_conditions(target).is_empty());
        assert_eq!(arena.scheduler.task_count(), 0);
    }

    #[test]
    fn heal_kill_effect_restores_the_killer() {
        let arena = Arena::new();
        let mut template = test_template(1);
        template.kill_effect = Some(KillEffect::Heal { amount: 30 });
        let entity = arena.monster(template, 0.0, 0.0);
        let hero = arena.character(1, 0.0, 0.0);
        hero.state().vitals.apply_raw_damage(50);
        arena
            .combat
            .apply_damage(
                AttackerRef::Character(CharacterId(1)),
                TargetRef::Entity(entity.id),
                200,
            )
            .expect("kill");
        assert_eq!(hero.snapshot().vitals.health, 180);
    }

    #[test]
    fn condition_kill_effect_afflicts_the_killer() {
        let arena = Arena::new();
        let mut template = test_template(1);
        template.kill_effect = Some(KillEffect::Condition(ConditionSpec {
            kind: ConditionKind::Poison,
            tick_amount: 4,
            interval_ms: 100,
            ticks: 2,
        }));
        let entity = arena.monster(template, 0.0, 0.0);
        let hero = arena.character(1, 0.0, 0.0);
        let start = Instant::now();
        arena
            .combat
            .apply_damage(
                AttackerRef::Character(CharacterId(1)),
                TargetRef::Entity(entity.id),
                200,
            )
            .expect("kill");
        let target = TargetRef::Character(CharacterId(1));
        assert_eq!(arena.combat.active_conditions(target), vec![ConditionKind::Poison]);

        arena.scheduler.run_due(start + Duration::from_millis(150));
        assert_eq!(hero.snapshot().vitals.health, 196);
    }

    #[test]
    fn refused_area_effect_reports_the_scheduler() {
        let arena = Arena::new();
        arena.monster(test_template(1), 0.0, 0.0);
        arena.character(1, 0.5, 0.5);
        arena.scheduler.shutdown();

        let err = arena
            .combat
            .area_attack(CharacterId(1), Position::new(0.5, 0.5), 2.0, Duration::from_millis(500))
            .unwrap_err();
        assert_eq!(err, CombatError::Scheduler(SchedulerError::Stopped));
    }

    #[test]
    fn deferred_hits_are_all_or_nothing_on_validation() {
        let arena = Arena::new();
        let near = arena.monster(test_template(1), 1.0, 0.0);
        let far = arena.monster(test_template(1), 20.0, 0.0);
        arena.character(1, 0.0, 0.0);
        let delays = [
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300),
        ];

        let err = arena
            .combat
            .declare_deferred(CharacterId(1), TargetRef::Entity(far.id), &delays, 3.0)
            .unwrap_err();
        assert_eq!(err, CombatError::OutOfRange);
        assert_eq!(arena.scheduler.task_count(), 0);

        let scheduled = arena
            .combat
            .declare_deferred(CharacterId(1), TargetRef::Entity(near.id), &delays, 3.0)
            .expect("deferred");
        assert_eq!(scheduled, 3);
        assert_eq!(arena.scheduler.task_count(), 3);
        arena.scheduler.run_due(Instant::now() + Duration::from_secs(1));
        assert_eq!(near.snapshot().vitals.health, 70);
    }
}
