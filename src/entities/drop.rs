use crate::entities::creature::{CharacterId, EntityId, MapKey, PresentationId};
use crate::world::position::Position;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropPayload {
    pub item: u32,
    pub count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub owner: CharacterId,
    pub until: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DropState {
    pub presentation_id: Option<PresentationId>,
    /// Looted or expired; the registry entry is on its way out.
    pub gone: bool,
}

/// Item lying on the ground. Everything but the presentation id and the
/// gone flag is fixed at creation.
#[derive(Debug)]
pub struct ItemDrop {
    pub id: EntityId,
    pub map: MapKey,
    pub position: Position,
    pub payload: DropPayload,
    pub claim: Option<Claim>,
    state: Mutex<DropState>,
}

impl ItemDrop {
    pub fn new(
        id: EntityId,
        map: MapKey,
        position: Position,
        payload: DropPayload,
        claim: Option<Claim>,
    ) -> Self {
        Self {
            id,
            map,
            position,
            payload,
            claim,
            state: Mutex::new(DropState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, DropState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_claim(&self, now: Instant) -> Option<CharacterId> {
        self.claim
            .filter(|claim| claim.until > now)
            .map(|claim| claim.owner)
    }

    pub fn claimed_by_other(&self, observer: CharacterId, now: Instant) -> bool {
        matches!(self.active_claim(now), Some(owner) if owner != observer)
    }

    pub fn is_gone(&self) -> bool {
        self.state().gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn claim_protects_until_it_lapses() {
        let now = Instant::now();
        let drop = ItemDrop::new(
            EntityId(1),
            MapKey::new(1, 1),
            Position::new(0.0, 0.0),
            DropPayload { item: 7, count: 1 },
            Some(Claim {
                owner: CharacterId(1),
                until: now + Duration::from_secs(5),
            }),
        );
        assert!(!drop.claimed_by_other(CharacterId(1), now));
        assert!(drop.claimed_by_other(CharacterId(2), now));
        assert!(!drop.claimed_by_other(CharacterId(2), now + Duration::from_secs(6)));
        assert_eq!(drop.active_claim(now + Duration::from_secs(6)), None);
    }
}
