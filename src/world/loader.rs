use crate::entities::creature::{MapKey, TemplateId};
use crate::entities::template::TemplateLookup;
use crate::runtime::rng::GameRng;
use crate::world::position::Position;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Spawn area of one template: `amount` entities placed at random within
/// `radius` of `(x, y)`, each roaming that same radius.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpawnDefinition {
    pub template: TemplateId,
    pub x: f32,
    pub y: f32,
    #[serde(default = "default_amount")]
    pub amount: u16,
    #[serde(default)]
    pub radius: f32,
}

fn default_amount() -> u16 {
    1
}

impl SpawnDefinition {
    pub fn center(&self) -> Position {
        Position::new(self.x, self.y)
    }

    pub fn placements(&self, rng: &mut GameRng) -> Vec<Position> {
        (0..self.amount)
            .map(|_| random_point(self.center(), self.radius, rng))
            .collect()
    }
}

/// Uniform point inside the disc; the square root keeps the density flat.
pub fn random_point(center: Position, radius: f32, rng: &mut GameRng) -> Position {
    if radius <= 0.0 {
        return center;
    }
    let angle = rng.roll_unit() * std::f32::consts::TAU;
    let distance = radius * rng.roll_unit().sqrt();
    Position::new(
        center.x + distance * angle.cos(),
        center.y + distance * angle.sin(),
    )
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MapDefinition {
    pub id: u32,
    #[serde(default)]
    pub spawns: Vec<SpawnDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShardDefinition {
    pub id: u16,
    #[serde(default)]
    pub maps: Vec<MapDefinition>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct WorldDefinition {
    #[serde(default)]
    pub shards: Vec<ShardDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorldReport {
    pub shards: usize,
    pub maps: usize,
    pub spawns: usize,
    pub entities: usize,
    pub unknown_templates: Vec<TemplateId>,
}

impl WorldDefinition {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|err| format!("failed to read {}: {}", path.display(), err))?;
        Self::from_yaml_str(&content).map_err(|err| format!("{}: {}", path.display(), err))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, String> {
        let world: WorldDefinition = serde_yaml::from_str(content)
            .map_err(|err| format!("world parse failed: {}", err))?;
        let mut keys = BTreeSet::new();
        for (key, map) in world.maps() {
            if !keys.insert(key) {
                return Err(format!("duplicate map {}", key));
            }
            for spawn in &map.spawns {
                if spawn.radius < 0.0 {
                    return Err(format!(
                        "map {} spawn of template {} has a negative radius",
                        key, spawn.template.0
                    ));
                }
            }
        }
        Ok(world)
    }

    pub fn maps(&self) -> impl Iterator<Item = (MapKey, &MapDefinition)> + '_ {
        self.shards.iter().flat_map(|shard| {
            shard
                .maps
                .iter()
                .map(move |map| (MapKey::new(shard.id, map.id), map))
        })
    }

    /// Counts what a load would spawn and lists template ids the lookup
    /// does not know, without touching any engine state.
    pub fn validate(&self, templates: &dyn TemplateLookup) -> WorldReport {
        let mut report = WorldReport {
            shards: self.shards.len(),
            ..WorldReport::default()
        };
        let mut unknown = BTreeSet::new();
        for (_, map) in self.maps() {
            report.maps += 1;
            for spawn in &map.spawns {
                report.spawns += 1;
                if templates.template_for(spawn.template).is_some() {
                    report.entities += usize::from(spawn.amount);
                } else {
                    unknown.insert(spawn.template);
                }
            }
        }
        report.unknown_templates = unknown.into_iter().collect();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::template::{test_template, TemplateIndex};

    const WORLD: &str = "\
shards:
  - id: 1
    maps:
      - id: 1
        spawns:
          - {template: 1, x: 10.0, y: 10.0, amount: 3, radius: 4.0}
          - {template: 9, x: 0.0, y: 0.0}
      - id: 2
  - id: 2
    maps:
      - id: 1
        spawns:
          - {template: 1, x: 5.0, y: 5.0, amount: 2}
";

    #[test]
    fn parses_shards_maps_and_spawns() {
        let world = WorldDefinition::from_yaml_str(WORLD).expect("world");
        let keys: Vec<MapKey> = world.maps().map(|(key, _)| key).collect();
        assert_eq!(
            keys,
            vec![MapKey::new(1, 1), MapKey::new(1, 2), MapKey::new(2, 1)]
        );
        let spawn = &world.shards[0].maps[0].spawns[1];
        assert_eq!(spawn.amount, 1);
        assert_eq!(spawn.radius, 0.0);
    }

    #[test]
    fn validation_reports_unknown_templates() {
        let world = WorldDefinition::from_yaml_str(WORLD).expect("world");
        let mut templates = TemplateIndex::new();
        templates.insert(test_template(1));
        let report = world.validate(&templates);
        assert_eq!(report.shards, 2);
        assert_eq!(report.maps, 3);
        assert_eq!(report.spawns, 3);
        assert_eq!(report.entities, 5);
        assert_eq!(report.unknown_templates, vec![TemplateId(9)]);
    }

    #[test]
    fn duplicate_maps_are_rejected() {
        let content = "shards:\n  - id: 1\n    maps:\n      - id: 3\n      - id: 3\n";
        let err = WorldDefinition::from_yaml_str(content).unwrap_err();
        assert!(err.contains("duplicate map 1:3"));
    }

    #[test]
    fn placements_stay_inside_the_radius() {
        let spawn = SpawnDefinition {
            template: TemplateId(1),
            x: 10.0,
            y: -4.0,
            amount: 50,
            radius: 3.0,
        };
        let mut rng = GameRng::from_seed(11);
        let placed = spawn.placements(&mut rng);
        assert_eq!(placed.len(), 50);
        assert!(placed
            .iter()
            .all(|position| position.within(spawn.center(), 3.0 + 1e-4)));

        let pinned = SpawnDefinition { radius: 0.0, ..spawn };
        assert!(pinned
            .placements(&mut rng)
            .iter()
            .all(|position| *position == pinned.center()));
    }
}
