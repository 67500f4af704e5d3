use crate::combat::conditions::ConditionSpec;
use crate::entities::creature::{EntityKind, FactionId, TemplateId};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LootEntry {
    pub item: u32,
    #[serde(default = "one")]
    pub count_min: u16,
    #[serde(default = "one")]
    pub count_max: u16,
    /// Per-mille drop chance.
    pub chance: u16,
}

fn one() -> u16 {
    1
}

/// Written as a map keyed by `type`, e.g. `{ type: heal, amount: 10 }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KillEffect {
    Heal { amount: u32 },
    Condition(ConditionSpec),
}

/// Selects the built-in behavior rule set for a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    #[default]
    Standard,
    Passive,
    EventOnly,
    Companion,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityTemplate {
    pub id: TemplateId,
    pub name: String,
    #[serde(default)]
    pub kind: EntityKind,
    pub base_hp: u32,
    #[serde(default)]
    pub min_damage: u32,
    #[serde(default)]
    pub max_damage: u32,
    #[serde(default)]
    pub defense: u32,
    #[serde(default = "default_level")]
    pub level: u16,
    #[serde(default)]
    pub experience: u32,
    #[serde(default)]
    pub aggro_radius: f32,
    #[serde(default = "default_attack_range")]
    pub attack_range: f32,
    /// Distance at which a pursued target is given up; zero means twice the aggro radius.
    #[serde(default)]
    pub chase_radius: f32,
    /// World units per second; zero makes the entity stationary.
    #[serde(default)]
    pub speed: f32,
    #[serde(default)]
    pub think_interval_ms: Option<u64>,
    #[serde(default)]
    pub respawn_delay_ms: Option<u64>,
    #[serde(default)]
    pub faction: FactionId,
    #[serde(default)]
    pub aggressive: bool,
    #[serde(default)]
    pub loot: Vec<LootEntry>,
    #[serde(default)]
    pub kill_effect: Option<KillEffect>,
    #[serde(default)]
    pub rules: RuleKind,
    #[serde(default)]
    pub visual: u16,
}

fn default_level() -> u16 {
    1
}

fn default_attack_range() -> f32 {
    1.5
}

impl EntityTemplate {
    pub fn is_stationary(&self) -> bool {
        self.speed <= 0.0
    }

    pub fn effective_chase_radius(&self) -> f32 {
        if self.chase_radius > 0.0 {
            self.chase_radius
        } else {
            (self.aggro_radius * 2.0).max(self.attack_range)
        }
    }

    pub fn think_interval(&self, fallback: Duration) -> Duration {
        self.think_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(fallback)
            .max(Duration::from_millis(10))
    }

    pub fn respawn_delay(&self, fallback: Duration) -> Duration {
        self.respawn_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(fallback)
    }
}

/// Read-only template lookup provided by the static game-data layer.
pub trait TemplateLookup: Send + Sync {
    fn template_for(&self, id: TemplateId) -> Option<Arc<EntityTemplate>>;
}

#[derive(Debug, Default)]
pub struct TemplateIndex {
    templates: HashMap<TemplateId, Arc<EntityTemplate>>,
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    templates: Vec<EntityTemplate>,
}

impl TemplateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, template: EntityTemplate) -> Option<Arc<EntityTemplate>> {
        self.templates.insert(template.id, Arc::new(template))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, String> {
        let file: TemplateFile = serde_yaml::from_str(content)
            .map_err(|err| format!("template parse failed: {}", err))?;
        let mut index = Self::new();
        for template in file.templates {
            let id = template.id;
            if template.min_damage > template.max_damage {
                return Err(format!(
                    "template {} has min_damage above max_damage",
                    id.0
                ));
            }
            if index.insert(template).is_some() {
                return Err(format!("duplicate template id {}", id.0));
            }
        }
        Ok(index)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|err| format!("failed to read {}: {}", path.display(), err))?;
        Self::from_yaml_str(&content).map_err(|err| format!("{}: {}", path.display(), err))
    }
}

impl TemplateLookup for TemplateIndex {
    fn template_for(&self, id: TemplateId) -> Option<Arc<EntityTemplate>> {
        self.templates.get(&id).cloned()
    }
}

#[cfg(test)]
pub(crate) fn test_template(id: u32) -> EntityTemplate {
    EntityTemplate {
        id: TemplateId(id),
        name: format!("template-{}", id),
        kind: EntityKind::Monster,
        base_hp: 100,
        min_damage: 5,
        max_damage: 10,
        defense: 0,
        level: 1,
        experience: 50,
        aggro_radius: 5.0,
        attack_range: 1.5,
        chase_radius: 0.0,
        speed: 2.0,
        think_interval_ms: Some(500),
        respawn_delay_ms: Some(1000),
        faction: FactionId(7),
        aggressive: true,
        loot: Vec::new(),
        kill_effect: None,
        rules: RuleKind::Standard,
        visual: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::conditions::ConditionKind;

    const TEMPLATES: &str = r#"
templates:
  - id: 1
    name: Wolf
    base_hp: 40
    min_damage: 2
    max_damage: 6
    aggro_radius: 6.0
    speed: 3.0
    faction: 3
    aggressive: true
    loot:
      - { item: 3031, count_max: 5, chance: 800 }
  - id: 2
    name: Shopkeeper
    kind: npc
    base_hp: 1
    rules: event_only
    kill_effect: { type: heal, amount: 10 }
"#;

    #[test]
    fn parses_template_table() {
        let index = TemplateIndex::from_yaml_str(TEMPLATES).expect("templates");
        assert_eq!(index.len(), 2);
        let wolf = index.template_for(TemplateId(1)).expect("wolf");
        assert_eq!(wolf.base_hp, 40);
        assert_eq!(wolf.attack_range, 1.5);
        assert_eq!(wolf.loot[0].count_min, 1);
        assert_eq!(wolf.loot[0].count_max, 5);
        assert_eq!(wolf.effective_chase_radius(), 12.0);
        let keeper = index.template_for(TemplateId(2)).expect("npc");
        assert_eq!(keeper.kind, EntityKind::Npc);
        assert_eq!(keeper.rules, RuleKind::EventOnly);
        assert!(keeper.is_stationary());
        assert_eq!(keeper.kill_effect, Some(KillEffect::Heal { amount: 10 }));
    }

    #[test]
    fn parses_condition_kill_effect() {
        let table = r#"
templates:
  - id: 9
    name: Spider
    base_hp: 20
    kill_effect:
      type: condition
      kind: poison
      tick_amount: 3
      interval_ms: 1000
      ticks: 4
"#;
        let index = TemplateIndex::from_yaml_str(table).expect("templates");
        let spider = index.template_for(TemplateId(9)).expect("spider");
        assert_eq!(
            spider.kill_effect,
            Some(KillEffect::Condition(ConditionSpec {
                kind: ConditionKind::Poison,
                tick_amount: 3,
                interval_ms: 1000,
                ticks: 4,
            }))
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let doubled = "templates:\n  - { id: 1, name: a, base_hp: 1 }\n  - { id: 1, name: b, base_hp: 1 }\n";
        let err = TemplateIndex::from_yaml_str(doubled).expect_err("duplicate");
        assert!(err.contains("duplicate template id 1"));
    }

    #[test]
    fn intervals_fall_back_to_config() {
        let mut template = test_template(9);
        template.think_interval_ms = None;
        assert_eq!(
            template.think_interval(Duration::from_millis(700)),
            Duration::from_millis(700)
        );
        template.respawn_delay_ms = Some(2500);
        assert_eq!(
            template.respawn_delay(Duration::from_secs(10)),
            Duration::from_millis(2500)
        );
    }
}
