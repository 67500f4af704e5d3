use crate::entities::character::Character;
use crate::entities::creature::{CharacterId, EntityId, MapKey, PresentationId, ShardId, TemplateId};
use crate::entities::drop::{DropPayload, ItemDrop};
use crate::entities::entity::Entity;
use crate::net::broadcast::ShardLocator;
use crate::telemetry::logging;
use crate::world::observer::Category;
use crate::world::position::Position;
use crate::world::presentation::PresentationPool;
use crate::world::sectors::{IndexKey, SectorIndex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    Capacity { map: MapKey, resource: &'static str },
    UnknownMap(MapKey),
    UnknownTemplate(TemplateId),
    MapTornDown(MapKey),
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Capacity { map, resource } => {
                write!(f, "map {} has no free {}", map, resource)
            }
            SpawnError::UnknownMap(map) => write!(f, "unknown map {}", map),
            SpawnError::UnknownTemplate(id) => write!(f, "unknown template {}", id.0),
            SpawnError::MapTornDown(map) => write!(f, "map {} was torn down", map),
        }
    }
}

impl std::error::Error for SpawnError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LootError {
    Stale,
    ClaimedByOther { owner: CharacterId },
    OutOfRange,
}

impl fmt::Display for LootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LootError::Stale => write!(f, "drop no longer exists"),
            LootError::ClaimedByOther { owner } => {
                write!(f, "drop is claimed by character {}", owner.0)
            }
            LootError::OutOfRange => write!(f, "drop is out of reach"),
        }
    }
}

impl std::error::Error for LootError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryConfig {
    pub sector_size: f32,
    pub presentation_capacity: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sector_size: 16.0,
            presentation_capacity: u16::MAX,
        }
    }
}

#[derive(Debug, Default)]
struct MapStructure {
    entities: HashMap<EntityId, Arc<Entity>>,
    drops: HashMap<EntityId, Arc<ItemDrop>>,
    characters: HashMap<CharacterId, Arc<Character>>,
}

/// One (shard, map) slice of the world.
///
/// Lock order inside a partition: `structure`, then `sectors`, then any
/// entity, character or drop state lock, then `pool`. The pool is a leaf
/// and may be taken while an entity's state lock is held.
#[derive(Debug)]
pub struct MapPartition {
    key: MapKey,
    structure: RwLock<MapStructure>,
    sectors: RwLock<SectorIndex>,
    pool: Mutex<PresentationPool>,
    torn_down: AtomicBool,
}

impl MapPartition {
    fn new(key: MapKey, config: RegistryConfig) -> Self {
        Self {
            key,
            structure: RwLock::new(MapStructure::default()),
            sectors: RwLock::new(SectorIndex::new(config.sector_size)),
            pool: Mutex::new(PresentationPool::new(config.presentation_capacity)),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> MapKey {
        self.key
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn read(&self) -> RwLockReadGuard<'_, MapStructure> {
        self.structure.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MapStructure> {
        self.structure.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool(&self) -> MutexGuard<'_, PresentationPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn place(&self, key: IndexKey, position: Position) {
        self.sectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .place(key, position);
    }

    fn unplace(&self, key: IndexKey) {
        self.sectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn candidates(&self, center: Position, radius: f32) -> Vec<IndexKey> {
        self.sectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .candidates(center, radius)
    }

    /// An observer started showing `id`. Callers hold the owner's state lock
    /// so the id cannot be retired underneath them.
    pub fn retain_view(&self, id: PresentationId) -> bool {
        self.pool().retain_view(id)
    }

    pub fn release_view(&self, id: PresentationId) -> bool {
        self.pool().release_view(id)
    }

    pub fn retire(&self, id: PresentationId) -> bool {
        self.pool().retire(id)
    }

    pub fn presentation_ids_in_use(&self) -> usize {
        self.pool().in_use()
    }

    pub fn entity_count(&self) -> usize {
        self.read().entities.len()
    }

    pub fn drop_count(&self) -> usize {
        self.read().drops.len()
    }

    pub fn character_count(&self) -> usize {
        self.read().characters.len()
    }
}

/// Authoritative world state, partitioned by (shard, map) so unrelated maps
/// never contend.
#[derive(Debug)]
pub struct EntityRegistry {
    config: RegistryConfig,
    maps: RwLock<HashMap<MapKey, Arc<MapPartition>>>,
    characters: RwLock<HashMap<CharacterId, Arc<Character>>>,
    entity_maps: RwLock<HashMap<EntityId, MapKey>>,
    next_entity_id: AtomicU32,
}

impl EntityRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            maps: RwLock::new(HashMap::new()),
            characters: RwLock::new(HashMap::new()),
            entity_maps: RwLock::new(HashMap::new()),
            next_entity_id: AtomicU32::new(1),
        }
    }

    pub fn ensure_map(&self, key: MapKey) -> Arc<MapPartition> {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            maps.entry(key)
                .or_insert_with(|| Arc::new(MapPartition::new(key, self.config))),
        )
    }

    pub fn partition(&self, key: MapKey) -> Option<Arc<MapPartition>> {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    pub fn maps(&self) -> Vec<MapKey> {
        let mut keys: Vec<MapKey> = self
            .maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        keys.sort();
        keys
    }

    fn live_partition(&self, key: MapKey) -> Result<Arc<MapPartition>, SpawnError> {
        let partition = self.partition(key).ok_or(SpawnError::UnknownMap(key))?;
        if partition.is_torn_down() {
            return Err(SpawnError::MapTornDown(key));
        }
        Ok(partition)
    }

    /// Detaches the map. Entities are invalidated so their loops finish on
    /// their next iteration; characters stay registered for the caller to
    /// move elsewhere.
    pub fn teardown_map(&self, key: MapKey) -> Option<Arc<MapPartition>> {
        let partition = self
            .maps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)?;
        partition.torn_down.store(true, Ordering::SeqCst);
        let entities: Vec<Arc<Entity>> = partition.read().entities.values().cloned().collect();
        {
            let mut entity_maps = self
                .entity_maps
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for entity in &entities {
                entity.invalidate();
                entity_maps.remove(&entity.id);
            }
        }
        for drop in partition.read().drops.values() {
            drop.state().gone = true;
        }
        logging::log_game(&format!(
            "map {} torn down with {} entities",
            key,
            entities.len()
        ));
        Some(partition)
    }

    pub fn allocate_entity_id(&self) -> EntityId {
        EntityId(self.next_entity_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self, key: MapKey, id: EntityId) -> Option<Arc<Entity>> {
        self.partition(key)?.read().entities.get(&id).cloned()
    }

    pub fn find_entity(&self, id: EntityId) -> Option<Arc<Entity>> {
        let key = *self
            .entity_maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)?;
        self.get(key, id)
    }

    /// Calls `visit` for every entity on the map. The map lock is released
    /// before the first call, so `visit` may use the registry freely.
    pub fn for_each_in_map<F>(&self, key: MapKey, mut visit: F)
    where
        F: FnMut(&Arc<Entity>),
    {
        let Some(partition) = self.partition(key) else {
            return;
        };
        let entities: Vec<Arc<Entity>> = partition.read().entities.values().cloned().collect();
        for entity in &entities {
            visit(entity);
        }
    }

    /// Registers a freshly built entity and gives it a presentation id in
    /// the same critical section.
    pub fn insert(&self, entity: Entity) -> Result<Arc<Entity>, SpawnError> {
        let key = entity.map;
        let partition = self.live_partition(key)?;
        let entity = Arc::new(entity);
        let position = {
            let mut structure = partition.write();
            let id = partition.pool().allocate().ok_or(SpawnError::Capacity {
                map: key,
                resource: "presentation id",
            })?;
            let position = {
                let mut state = entity.state();
                state.presentation_id = Some(id);
                state.position
            };
            structure.entities.insert(entity.id, Arc::clone(&entity));
            position
        };
        partition.place(IndexKey::Entity(entity.id), position);
        self.entity_maps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.id, key);
        Ok(entity)
    }

    /// Gives a respawning entity a fresh id. An entity that already holds a
    /// live id keeps it.
    pub fn assign_presentation_id(&self, entity: &Entity) -> Result<PresentationId, SpawnError> {
        let partition = self.live_partition(entity.map)?;
        let _structure = partition.write();
        let mut state = entity.state();
        if let Some(id) = state.presentation_id {
            return Ok(id);
        }
        let id = partition.pool().allocate().ok_or(SpawnError::Capacity {
            map: entity.map,
            resource: "presentation id",
        })?;
        state.presentation_id = Some(id);
        Ok(id)
    }

    /// Undoes an `insert` whose entity could not be brought to life. The
    /// entity is invalidated and its presentation id retired.
    pub fn remove_entity(&self, key: MapKey, id: EntityId) -> Option<Arc<Entity>> {
        let partition = self.partition(key)?;
        let entity = partition.write().entities.remove(&id)?;
        partition.unplace(IndexKey::Entity(id));
        entity.invalidate();
        {
            let mut state = entity.state();
            state.alive = false;
            if let Some(presentation_id) = state.presentation_id.take() {
                partition.retire(presentation_id);
            }
        }
        self.entity_maps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Some(entity)
    }

    pub fn reindex_entity(&self, entity: &Entity) {
        if let Some(partition) = self.partition(entity.map) {
            partition.place(IndexKey::Entity(entity.id), entity.position());
        }
    }

    pub fn nearby_entities(
        &self,
        key: MapKey,
        center: Position,
        radius: f32,
        category: Option<Category>,
    ) -> Vec<Arc<Entity>> {
        let Some(partition) = self.partition(key) else {
            return Vec::new();
        };
        let keys = partition.candidates(center, radius);
        let entities: Vec<Arc<Entity>> = {
            let structure = partition.read();
            keys.into_iter()
                .filter_map(|index_key| match index_key {
                    IndexKey::Entity(id) => structure.entities.get(&id).cloned(),
                    _ => None,
                })
                .filter(|entity| category.map_or(true, |c| entity.category() == c))
                .collect()
        };
        entities
            .into_iter()
            .filter(|entity| entity.position().within(center, radius))
            .collect()
    }

    pub fn nearby_characters(
        &self,
        key: MapKey,
        center: Position,
        radius: f32,
    ) -> Vec<Arc<Character>> {
        let Some(partition) = self.partition(key) else {
            return Vec::new();
        };
        let keys = partition.candidates(center, radius);
        let characters: Vec<Arc<Character>> = {
            let structure = partition.read();
            keys.into_iter()
                .filter_map(|index_key| match index_key {
                    IndexKey::Character(id) => structure.characters.get(&id).cloned(),
                    _ => None,
                })
                .collect()
        };
        characters
            .into_iter()
            .filter(|character| character.position().within(center, radius))
            .collect()
    }

    pub fn nearby_drops(&self, key: MapKey, center: Position, radius: f32) -> Vec<Arc<ItemDrop>> {
        let Some(partition) = self.partition(key) else {
            return Vec::new();
        };
        let keys = partition.candidates(center, radius);
        let structure = partition.read();
        keys.into_iter()
            .filter_map(|index_key| match index_key {
                IndexKey::Drop(id) => structure.drops.get(&id).cloned(),
                _ => None,
            })
            .filter(|drop| drop.position.within(center, radius))
            .collect()
    }

    pub fn add_character(&self, character: Character) -> Result<Arc<Character>, SpawnError> {
        let (key, position) = {
            let state = character.state();
            (state.map, state.position)
        };
        let partition = self.live_partition(key)?;
        let character = Arc::new(character);
        partition
            .write()
            .characters
            .insert(character.id, Arc::clone(&character));
        partition.place(IndexKey::Character(character.id), position);
        self.characters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(character.id, Arc::clone(&character));
        Ok(character)
    }

    pub fn character(&self, id: CharacterId) -> Option<Arc<Character>> {
        self.characters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn character_count(&self) -> usize {
        self.characters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn remove_character(&self, id: CharacterId) -> Option<Arc<Character>> {
        let character = self
            .characters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)?;
        if let Some(partition) = self.partition(character.map()) {
            partition.write().characters.remove(&id);
            partition.unplace(IndexKey::Character(id));
        }
        Some(character)
    }

    pub fn move_character(&self, id: CharacterId, position: Position) -> bool {
        let Some(character) = self.character(id) else {
            return false;
        };
        let key = {
            let mut state = character.state();
            state.position = position;
            state.map
        };
        if let Some(partition) = self.partition(key) {
            partition.place(IndexKey::Character(id), position);
        }
        true
    }

    pub fn transfer_character(
        &self,
        id: CharacterId,
        destination: MapKey,
        position: Position,
    ) -> Result<(), SpawnError> {
        let target = self.live_partition(destination)?;
        let character = self.character(id).ok_or(SpawnError::UnknownMap(destination))?;
        let previous = character.map();
        if let Some(source) = self.partition(previous) {
            source.write().characters.remove(&id);
            source.unplace(IndexKey::Character(id));
        }
        {
            let mut state = character.state();
            state.map = destination;
            state.position = position;
        }
        target.write().characters.insert(id, Arc::clone(&character));
        target.place(IndexKey::Character(id), position);
        Ok(())
    }

    pub fn insert_drop(&self, drop: ItemDrop) -> Result<Arc<ItemDrop>, SpawnError> {
        let key = drop.map;
        let partition = self.live_partition(key)?;
        let drop = Arc::new(drop);
        {
            let mut structure = partition.write();
            let id = partition.pool().allocate().ok_or(SpawnError::Capacity {
                map: key,
                resource: "presentation id",
            })?;
            drop.state().presentation_id = Some(id);
            structure.drops.insert(drop.id, Arc::clone(&drop));
        }
        partition.place(IndexKey::Drop(drop.id), drop.position);
        Ok(drop)
    }

    pub fn drop_by_id(&self, key: MapKey, id: EntityId) -> Option<Arc<ItemDrop>> {
        self.partition(key)?.read().drops.get(&id).cloned()
    }

    /// Takes a drop out of the world. Only the first caller gets it back.
    pub fn remove_drop(&self, key: MapKey, id: EntityId) -> Option<Arc<ItemDrop>> {
        let partition = self.partition(key)?;
        let drop = partition.read().drops.get(&id).cloned()?;
        {
            let mut state = drop.state();
            if state.gone {
                return None;
            }
            state.gone = true;
            if let Some(presentation_id) = state.presentation_id.take() {
                partition.retire(presentation_id);
            }
        }
        partition.write().drops.remove(&id);
        partition.unplace(IndexKey::Drop(id));
        Some(drop)
    }

    /// Claim checks happen before anything is touched: a refused attempt
    /// leaves the drop exactly as it was.
    pub fn loot_drop(
        &self,
        looter: CharacterId,
        key: MapKey,
        drop_id: EntityId,
        reach: f32,
        now: Instant,
    ) -> Result<DropPayload, LootError> {
        let character = self.character(looter).ok_or(LootError::Stale)?;
        let drop = self.drop_by_id(key, drop_id).ok_or(LootError::Stale)?;
        if drop.is_gone() {
            return Err(LootError::Stale);
        }
        if let Some(owner) = drop.active_claim(now) {
            if owner != looter {
                return Err(LootError::ClaimedByOther { owner });
            }
        }
        let (map, position) = {
            let state = character.state();
            (state.map, state.position)
        };
        if map != key || !position.within(drop.position, reach) {
            return Err(LootError::OutOfRange);
        }
        let taken = self.remove_drop(key, drop_id).ok_or(LootError::Stale)?;
        Ok(taken.payload)
    }

    pub fn entity_count(&self) -> usize {
        self.entity_maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ShardLocator for EntityRegistry {
    fn shard_of(&self, character: CharacterId) -> Option<ShardId> {
        self.character(character).map(|character| character.map().shard)
    }
}
