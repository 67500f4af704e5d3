use crate::entities::creature::{CharacterId, EntityId, EntityKind, PresentationId};
use crate::net::events::Subject;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Players,
    Monsters,
    Npcs,
    Drops,
    Pets,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Players,
        Category::Monsters,
        Category::Npcs,
        Category::Drops,
        Category::Pets,
    ];

    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Monster => Category::Monsters,
            EntityKind::Npc => Category::Npcs,
            EntityKind::Pet => Category::Pets,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Category::Players => 0,
            Category::Monsters => 1,
            Category::Npcs => 2,
            Category::Drops => 3,
            Category::Pets => 4,
        }
    }
}

/// What an observer needs to later say goodbye to an entity without
/// looking it up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenEntry {
    pub presentation_id: PresentationId,
    pub generation: u32,
}

pub type EntitySet = HashMap<EntityId, SeenEntry>;

/// Visibility set of one connected character. Only that character's diff
/// pass mutates it; the broadcast channel reads it at delivery time.
#[derive(Debug)]
pub struct ObserverView {
    character: CharacterId,
    players: Mutex<HashSet<CharacterId>>,
    monsters: Mutex<EntitySet>,
    npcs: Mutex<EntitySet>,
    drops: Mutex<EntitySet>,
    pets: Mutex<EntitySet>,
}

impl ObserverView {
    pub fn new(character: CharacterId) -> Self {
        Self {
            character,
            players: Mutex::new(HashSet::new()),
            monsters: Mutex::new(HashMap::new()),
            npcs: Mutex::new(HashMap::new()),
            drops: Mutex::new(HashMap::new()),
            pets: Mutex::new(HashMap::new()),
        }
    }

    pub fn character(&self) -> CharacterId {
        self.character
    }

    pub fn lock_players(&self) -> MutexGuard<'_, HashSet<CharacterId>> {
        self.players.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` for `Players`, which is keyed by character instead.
    pub fn lock_entities(&self, category: Category) -> Option<MutexGuard<'_, EntitySet>> {
        let set = match category {
            Category::Players => return None,
            Category::Monsters => &self.monsters,
            Category::Npcs => &self.npcs,
            Category::Drops => &self.drops,
            Category::Pets => &self.pets,
        };
        Some(set.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn holds(&self, subject: Subject) -> bool {
        match subject {
            Subject::Character(character) => self.lock_players().contains(&character),
            Subject::Entity { category, id } => self
                .lock_entities(category)
                .map(|set| set.contains_key(&id))
                .unwrap_or(false),
        }
    }

    pub fn seen(&self, category: Category, id: EntityId) -> Option<SeenEntry> {
        self.lock_entities(category)
            .and_then(|set| set.get(&id).copied())
    }

    pub fn len(&self, category: Category) -> usize {
        match category {
            Category::Players => self.lock_players().len(),
            other => self.lock_entities(other).map(|set| set.len()).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        Category::ALL.iter().all(|category| self.len(*category) == 0)
    }

    /// Empties every category, returning what was held so the caller can
    /// release presentation ids.
    pub fn drain(&self) -> (Vec<CharacterId>, Vec<(Category, EntityId, SeenEntry)>) {
        let players = self.lock_players().drain().collect();
        let mut entities = Vec::new();
        for category in Category::ALL {
            if let Some(mut set) = self.lock_entities(category) {
                entities.extend(set.drain().map(|(id, seen)| (category, id, seen)));
            }
        }
        (players, entities)
    }
}
