use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapId(pub u32);

/// Partition key of the entity registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapKey {
    pub shard: ShardId,
    pub map: MapId,
}

impl MapKey {
    pub const fn new(shard: u16, map: u32) -> Self {
        Self {
            shard: ShardId(shard),
            map: MapId(map),
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shard.0, self.map.0)
    }
}

/// Stable registry key of a monster, npc, pet or drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacterId(pub u32);

/// Short, map-scoped id that observers use to address an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PresentationId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FactionId(pub u16);

impl FactionId {
    pub const NEUTRAL: FactionId = FactionId(0);

    pub fn is_neutral(self) -> bool {
        self == Self::NEUTRAL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[default]
    Monster,
    Npc,
    Pet,
}

/// How an entity is coloured for one particular observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    Hostile,
    Neutral,
    Friendly,
}

impl Relation {
    pub fn between(entity_faction: FactionId, aggressive: bool, observer_faction: FactionId) -> Self {
        if entity_faction.is_neutral() {
            return Relation::Neutral;
        }
        if entity_faction == observer_faction {
            return Relation::Friendly;
        }
        if aggressive {
            Relation::Hostile
        } else {
            Relation::Neutral
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Relation::Hostile => 0,
            Relation::Neutral => 1,
            Relation::Friendly => 2,
        }
    }
}

/// Who dealt a hit. Environment damage (traps, expiring conditions without
/// a known source) never earns kill credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttackerRef {
    Character(CharacterId),
    Entity(EntityId),
    Environment,
}

impl AttackerRef {
    pub fn character(self) -> Option<CharacterId> {
        match self {
            AttackerRef::Character(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetRef {
    Character(CharacterId),
    Entity(EntityId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_respects_faction_and_aggression() {
        let wolves = FactionId(3);
        let guards = FactionId(1);
        assert_eq!(Relation::between(wolves, true, guards), Relation::Hostile);
        assert_eq!(Relation::between(wolves, false, guards), Relation::Neutral);
        assert_eq!(Relation::between(guards, true, guards), Relation::Friendly);
        assert_eq!(Relation::between(FactionId::NEUTRAL, true, guards), Relation::Neutral);
    }

    #[test]
    fn map_key_displays_shard_and_map() {
        assert_eq!(MapKey::new(2, 100).to_string(), "2:100");
    }
}
