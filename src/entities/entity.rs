use crate::entities::creature::{AttackerRef, CharacterId, EntityId, EntityKind, MapKey, PresentationId};
use crate::entities::stats::Vitals;
use crate::entities::template::EntityTemplate;
use crate::runtime::timers::TaskId;
use crate::world::observer::Category;
use crate::world::position::Position;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BehaviorState {
    #[default]
    Idle,
    Roaming,
    Pursuing,
    Attacking,
    Dead,
    Respawning,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnPoint {
    pub position: Position,
    pub roam_radius: f32,
}

/// Fields that change every few hundred milliseconds. Guarded by the
/// entity's own lock, never by the map lock.
#[derive(Debug, Clone)]
pub struct EntityState {
    pub presentation_id: Option<PresentationId>,
    pub position: Position,
    pub vitals: Vitals,
    pub behavior: BehaviorState,
    pub alive: bool,
    /// Current combat counterpart: the pursued target or the last attacker.
    pub engaged: Option<CharacterId>,
    pub roam_target: Option<Position>,
    pub next_roam_at: Option<Instant>,
    /// Bumped on every respawn so observers can tell incarnations apart.
    pub generation: u32,
    pub killer: Option<AttackerRef>,
    pub last_step: Option<Instant>,
}

#[derive(Debug)]
pub struct Entity {
    pub id: EntityId,
    pub map: MapKey,
    pub template: Arc<EntityTemplate>,
    pub spawn: SpawnPoint,
    /// Owning character for pets.
    pub owner: Option<CharacterId>,
    state: Mutex<EntityState>,
    viewers: Mutex<HashSet<CharacterId>>,
    invalidated: AtomicBool,
    behavior_task: Mutex<Option<TaskId>>,
}

impl Entity {
    pub fn new(
        id: EntityId,
        map: MapKey,
        template: Arc<EntityTemplate>,
        spawn: SpawnPoint,
        owner: Option<CharacterId>,
    ) -> Self {
        let vitals = Vitals::full(template.base_hp);
        Self {
            id,
            map,
            template,
            spawn,
            owner,
            state: Mutex::new(EntityState {
                presentation_id: None,
                position: spawn.position,
                vitals,
                behavior: BehaviorState::Idle,
                alive: true,
                engaged: None,
                roam_target: None,
                next_roam_at: None,
                generation: 0,
                killer: None,
                last_step: None,
            }),
            viewers: Mutex::new(HashSet::new()),
            invalidated: AtomicBool::new(false),
            behavior_task: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.template.kind
    }

    pub fn category(&self) -> Category {
        Category::for_kind(self.template.kind)
    }

    pub fn state(&self) -> MutexGuard<'_, EntityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> EntityState {
        self.state().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.state().alive
    }

    pub fn position(&self) -> Position {
        self.state().position
    }

    pub fn presentation_id(&self) -> Option<PresentationId> {
        self.state().presentation_id
    }

    /// Marks the entity permanently gone; its behavior loop ends on its
    /// next iteration.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub fn add_viewer(&self, character: CharacterId) {
        self.viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(character);
    }

    pub fn remove_viewer(&self, character: CharacterId) {
        self.viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&character);
    }

    pub fn viewers(&self) -> Vec<CharacterId> {
        self.viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn behavior_task(&self) -> Option<TaskId> {
        *self
            .behavior_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behavior_task(&self, task: Option<TaskId>) -> Option<TaskId> {
        std::mem::replace(
            &mut *self
                .behavior_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            task,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::template::test_template;

    fn wolf() -> Entity {
        Entity::new(
            EntityId(1),
            MapKey::new(1, 1),
            Arc::new(test_template(1)),
            SpawnPoint {
                position: Position::new(10.0, 10.0),
                roam_radius: 3.0,
            },
            None,
        )
    }

    #[test]
    fn starts_alive_at_spawn() {
        let entity = wolf();
        let state = entity.snapshot();
        assert!(state.alive);
        assert_eq!(state.behavior, BehaviorState::Idle);
        assert_eq!(state.position, Position::new(10.0, 10.0));
        assert_eq!(state.vitals.health, 100);
        assert_eq!(entity.category(), Category::Monsters);
    }

    #[test]
    fn viewers_and_invalidation() {
        let entity = wolf();
        entity.add_viewer(CharacterId(3));
        entity.add_viewer(CharacterId(3));
        assert_eq!(entity.viewers(), vec![CharacterId(3)]);
        entity.remove_viewer(CharacterId(3));
        assert!(entity.viewers().is_empty());

        assert!(!entity.is_invalidated());
        entity.invalidate();
        assert!(entity.is_invalidated());
    }
}
