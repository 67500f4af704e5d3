use crate::entities::creature::{CharacterId, EntityId};
use crate::world::position::Position;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorCoord {
    pub x: i32,
    pub y: i32,
}

/// Anything the index can place on a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Entity(EntityId),
    Drop(EntityId),
    Character(CharacterId),
}

/// Coarse grid over one map. It only narrows candidates; callers apply the
/// exact distance test against authoritative positions.
#[derive(Debug)]
pub struct SectorIndex {
    sector_size: f32,
    sectors: HashMap<SectorCoord, HashSet<IndexKey>>,
    placed: HashMap<IndexKey, SectorCoord>,
}

impl SectorIndex {
    pub fn new(sector_size: f32) -> Self {
        Self {
            sector_size: if sector_size > 0.0 { sector_size } else { 16.0 },
            sectors: HashMap::new(),
            placed: HashMap::new(),
        }
    }

    pub fn sector_of(&self, position: Position) -> SectorCoord {
        SectorCoord {
            x: (position.x / self.sector_size).floor() as i32,
            y: (position.y / self.sector_size).floor() as i32,
        }
    }

    pub fn sectors_in_range(&self, center: Position, radius: f32) -> Vec<SectorCoord> {
        let radius = radius.max(0.0);
        let min = self.sector_of(Position::new(center.x - radius, center.y - radius));
        let max = self.sector_of(Position::new(center.x + radius, center.y + radius));
        let mut sectors = Vec::new();
        for x in min.x..=max.x {
            for y in min.y..=max.y {
                sectors.push(SectorCoord { x, y });
            }
        }
        sectors
    }

    pub fn place(&mut self, key: IndexKey, position: Position) {
        let sector = self.sector_of(position);
        if let Some(previous) = self.placed.insert(key, sector) {
            if previous == sector {
                return;
            }
            self.detach(key, previous);
        }
        self.sectors.entry(sector).or_default().insert(key);
    }

    pub fn remove(&mut self, key: IndexKey) -> bool {
        match self.placed.remove(&key) {
            Some(sector) => {
                self.detach(key, sector);
                true
            }
            None => false,
        }
    }

    fn detach(&mut self, key: IndexKey, sector: SectorCoord) {
        if let Some(members) = self.sectors.get_mut(&sector) {
            members.remove(&key);
            if members.is_empty() {
                self.sectors.remove(&sector);
            }
        }
    }

    /// Keys in every sector touching the square around `center`. Padded by
    /// one sector so a move that has not been re-indexed yet is still found.
    pub fn candidates(&self, center: Position, radius: f32) -> Vec<IndexKey> {
        let mut keys = Vec::new();
        for sector in self.sectors_in_range(center, radius + self.sector_size) {
            if let Some(members) = self.sectors.get(&sector) {
                keys.extend(members.iter().copied());
            }
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.placed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_coordinates_floor() {
        let index = SectorIndex::new(16.0);
        assert_eq!(index.sector_of(Position::new(-0.5, 15.9)), SectorCoord { x: -1, y: 0 });
        assert_eq!(index.sectors_in_range(Position::new(8.0, 8.0), 8.0).len(), 4);
    }

    #[test]
    fn moving_keys_changes_sector_membership() {
        let mut index = SectorIndex::new(10.0);
        let key = IndexKey::Entity(EntityId(1));
        index.place(key, Position::new(5.0, 5.0));
        index.place(IndexKey::Character(CharacterId(2)), Position::new(500.0, 500.0));
        assert!(index.candidates(Position::new(0.0, 0.0), 10.0).contains(&key));

        index.place(key, Position::new(200.0, 200.0));
        assert!(!index.candidates(Position::new(0.0, 0.0), 10.0).contains(&key));
        assert!(index.candidates(Position::new(195.0, 195.0), 10.0).contains(&key));
        assert_eq!(index.len(), 2);

        assert!(index.remove(key));
        assert!(!index.remove(key));
        assert_eq!(index.len(), 1);
    }
}
