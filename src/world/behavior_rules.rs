use crate::entities::character::CharacterState;
use crate::entities::creature::{CharacterId, Relation, TemplateId};
use crate::entities::entity::Entity;
use crate::entities::template::{EntityTemplate, RuleKind};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Engagement policy of a template. The behavior loop asks these questions
/// instead of branching on template ids itself.
pub trait BehaviorRules: Send + Sync {
    /// May `candidate` be picked up as a target on sight?
    fn should_aggro(&self, entity: &Entity, candidate: &CharacterState) -> bool;

    /// Does being hit by `attacker` make the entity fight back?
    fn retaliates(&self, entity: &Entity, attacker: CharacterId) -> bool;

    /// Character the entity trails while it has nothing else to do.
    fn follow_target(&self, _entity: &Entity) -> Option<CharacterId> {
        None
    }
}

/// Faction and aggression filter.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardRules;

impl BehaviorRules for StandardRules {
    fn should_aggro(&self, entity: &Entity, candidate: &CharacterState) -> bool {
        let template = &entity.template;
        candidate.alive
            && Relation::between(template.faction, template.aggressive, candidate.profile.faction)
                == Relation::Hostile
    }

    fn retaliates(&self, _entity: &Entity, _attacker: CharacterId) -> bool {
        true
    }
}

/// Faction-neutral: never starts a fight but answers one.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveRules;

impl BehaviorRules for PassiveRules {
    fn should_aggro(&self, _entity: &Entity, _candidate: &CharacterState) -> bool {
        false
    }

    fn retaliates(&self, _entity: &Entity, _attacker: CharacterId) -> bool {
        true
    }
}

/// Scripted event actors; only events move them.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventOnlyRules;

impl BehaviorRules for EventOnlyRules {
    fn should_aggro(&self, _entity: &Entity, _candidate: &CharacterState) -> bool {
        false
    }

    fn retaliates(&self, _entity: &Entity, _attacker: CharacterId) -> bool {
        false
    }
}

/// Pets trail their owner and defend themselves against anyone else.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompanionRules;

impl BehaviorRules for CompanionRules {
    fn should_aggro(&self, _entity: &Entity, _candidate: &CharacterState) -> bool {
        false
    }

    fn retaliates(&self, entity: &Entity, attacker: CharacterId) -> bool {
        entity.owner != Some(attacker)
    }

    fn follow_target(&self, entity: &Entity) -> Option<CharacterId> {
        entity.owner
    }
}

/// Built-in rule sets plus per-template overrides.
pub struct RuleBook {
    standard: Arc<dyn BehaviorRules>,
    passive: Arc<dyn BehaviorRules>,
    event_only: Arc<dyn BehaviorRules>,
    companion: Arc<dyn BehaviorRules>,
    overrides: RwLock<HashMap<TemplateId, Arc<dyn BehaviorRules>>>,
}

impl Default for RuleBook {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBook {
    pub fn new() -> Self {
        Self {
            standard: Arc::new(StandardRules),
            passive: Arc::new(PassiveRules),
            event_only: Arc::new(EventOnlyRules),
            companion: Arc::new(CompanionRules),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, template: TemplateId, rules: Arc<dyn BehaviorRules>) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(template, rules);
    }

    pub fn rules_for(&self, template: &EntityTemplate) -> Arc<dyn BehaviorRules> {
        if let Some(rules) = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&template.id)
        {
            return Arc::clone(rules);
        }
        let rules = match template.rules {
            RuleKind::Standard => &self.standard,
            RuleKind::Passive => &self.passive,
            RuleKind::EventOnly => &self.event_only,
            RuleKind::Companion => &self.companion,
        };
        Arc::clone(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::character::{Character, CharacterProfile};
    use crate::entities::creature::{EntityId, FactionId, MapKey};
    use crate::entities::entity::SpawnPoint;
    use crate::entities::template::test_template;
    use crate::world::position::Position;

    fn entity(template: EntityTemplate, owner: Option<CharacterId>) -> Entity {
        Entity::new(
            EntityId(1),
            MapKey::new(1, 1),
            Arc::new(template),
            SpawnPoint {
                position: Position::new(0.0, 0.0),
                roam_radius: 0.0,
            },
            owner,
        )
    }

    fn observer(faction: u16) -> CharacterState {
        Character::new(
            CharacterId(5),
            "Aldo",
            MapKey::new(1, 1),
            Position::new(0.0, 0.0),
            CharacterProfile {
                faction: FactionId(faction),
                ..CharacterProfile::default()
            },
        )
        .snapshot()
    }

    #[test]
    fn standard_rules_filter_by_faction() {
        let book = RuleBook::new();
        let wolf = entity(test_template(1), None);
        let rules = book.rules_for(&wolf.template);
        assert!(rules.should_aggro(&wolf, &observer(2)));
        assert!(!rules.should_aggro(&wolf, &observer(7)));

        let mut dead = observer(2);
        dead.alive = false;
        assert!(!rules.should_aggro(&wolf, &dead));
    }

    #[test]
    fn neutral_faction_never_aggroes() {
        let book = RuleBook::new();
        let mut template = test_template(2);
        template.faction = FactionId::NEUTRAL;
        let deer = entity(template, None);
        assert!(!book.rules_for(&deer.template).should_aggro(&deer, &observer(2)));
    }

    #[test]
    fn built_in_overrides() {
        let book = RuleBook::new();
        let mut passive = test_template(3);
        passive.rules = RuleKind::Passive;
        let passive = entity(passive, None);
        let rules = book.rules_for(&passive.template);
        assert!(!rules.should_aggro(&passive, &observer(2)));
        assert!(rules.retaliates(&passive, CharacterId(5)));

        let mut event = test_template(4);
        event.rules = RuleKind::EventOnly;
        let event = entity(event, None);
        assert!(!book.rules_for(&event.template).retaliates(&event, CharacterId(5)));

        let mut pet = test_template(5);
        pet.rules = RuleKind::Companion;
        let pet = entity(pet, Some(CharacterId(5)));
        let rules = book.rules_for(&pet.template);
        assert_eq!(rules.follow_target(&pet), Some(CharacterId(5)));
        assert!(!rules.retaliates(&pet, CharacterId(5)));
        assert!(rules.retaliates(&pet, CharacterId(6)));
    }

    struct Pacifist;

    impl BehaviorRules for Pacifist {
        fn should_aggro(&self, _entity: &Entity, _candidate: &CharacterState) -> bool {
            false
        }

        fn retaliates(&self, _entity: &Entity, _attacker: CharacterId) -> bool {
            false
        }
    }

    #[test]
    fn registered_override_wins() {
        let book = RuleBook::new();
        let wolf = entity(test_template(1), None);
        book.register(TemplateId(1), Arc::new(Pacifist));
        let rules = book.rules_for(&wolf.template);
        assert!(!rules.should_aggro(&wolf, &observer(2)));
        assert!(!rules.retaliates(&wolf, CharacterId(5)));
    }
}
