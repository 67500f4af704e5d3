use crate::combat::queue::CombatTargetQueue;
use crate::entities::creature::{CharacterId, FactionId, MapKey};
use crate::entities::stats::Vitals;
use crate::world::position::Position;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PvpRecord {
    pub kills: u32,
    pub deaths: u32,
    pub infamy: u32,
}

/// Combat profile handed over by the persistence layer at login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacterProfile {
    pub level: u16,
    pub max_health: u32,
    pub min_damage: u32,
    pub max_damage: u32,
    pub defense: u32,
    pub faction: FactionId,
}

impl Default for CharacterProfile {
    fn default() -> Self {
        Self {
            level: 1,
            max_health: 150,
            min_damage: 1,
            max_damage: 5,
            defense: 0,
            faction: FactionId::NEUTRAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CharacterState {
    pub map: MapKey,
    pub position: Position,
    pub vitals: Vitals,
    pub alive: bool,
    pub mounted: bool,
    pub profile: CharacterProfile,
    pub experience: u64,
    pub pvp: PvpRecord,
}

/// Player-controlled character as the simulation sees it.
#[derive(Debug)]
pub struct Character {
    pub id: CharacterId,
    pub name: String,
    state: Mutex<CharacterState>,
    queue: Mutex<CombatTargetQueue>,
}

impl Character {
    pub fn new(
        id: CharacterId,
        name: impl Into<String>,
        map: MapKey,
        position: Position,
        profile: CharacterProfile,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            state: Mutex::new(CharacterState {
                map,
                position,
                vitals: Vitals::full(profile.max_health),
                alive: true,
                mounted: false,
                profile,
                experience: 0,
                pvp: PvpRecord::default(),
            }),
            queue: Mutex::new(CombatTargetQueue::new()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, CharacterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue(&self) -> MutexGuard<'_, CombatTargetQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> CharacterState {
        self.state().clone()
    }

    pub fn map(&self) -> MapKey {
        self.state().map
    }

    pub fn position(&self) -> Position {
        self.state().position
    }

    pub fn is_alive(&self) -> bool {
        self.state().alive
    }

    pub fn is_mounted(&self) -> bool {
        self.state().mounted
    }

    /// Brings a dead character back at full health, e.g. after a temple
    /// teleport handled by the login layer.
    pub fn revive(&self, position: Position) {
        let mut state = self.state();
        state.vitals.reset();
        state.alive = true;
        state.position = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_character_is_alive_with_full_health() {
        let character = Character::new(
            CharacterId(1),
            "Aldo",
            MapKey::new(1, 1),
            Position::new(0.0, 0.0),
            CharacterProfile::default(),
        );
        let state = character.snapshot();
        assert!(state.alive);
        assert!(!state.mounted);
        assert_eq!(state.vitals.health, 150);
        assert_eq!(state.pvp, PvpRecord::default());
    }

    #[test]
    fn revive_restores_health() {
        let character = Character::new(
            CharacterId(1),
            "Aldo",
            MapKey::new(1, 1),
            Position::new(0.0, 0.0),
            CharacterProfile::default(),
        );
        {
            let mut state = character.state();
            state.vitals.apply_raw_damage(500);
            state.alive = false;
        }
        character.revive(Position::new(4.0, 4.0));
        assert!(character.is_alive());
        assert_eq!(character.position(), Position::new(4.0, 4.0));
        assert_eq!(character.snapshot().vitals.health, 150);
    }
}
