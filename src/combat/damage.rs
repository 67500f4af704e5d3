use crate::runtime::rng::GameRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttackProfile {
    pub min_damage: u32,
    pub max_damage: u32,
    pub level: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefenseProfile {
    pub defense: u32,
    pub level: u16,
    pub remaining_health: u32,
}

/// `Bounded` rules report at most the target's remaining health, so
/// experience and damage numbers never include overkill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DamageRule {
    #[default]
    Standard,
    Bounded,
}

const MIN_HIT_CHANCE: u32 = 10;
const HIT_PENALTY_PER_LEVEL: u32 = 5;

/// Chance to land a hit at all, in percent. Attacking an equal or lower
/// level target always connects.
pub fn hit_chance_percent(attacker_level: u16, target_level: u16) -> u32 {
    if target_level <= attacker_level {
        return 100;
    }
    let diff = u32::from(target_level - attacker_level);
    100u32
        .saturating_sub(diff.saturating_mul(HIT_PENALTY_PER_LEVEL))
        .max(MIN_HIT_CHANCE)
}

/// Mitigates an already rolled base value.
pub fn resolve_damage(base: u32, defense: u32, rule: DamageRule, remaining_health: u32) -> u32 {
    let damage = base.saturating_sub(defense);
    match rule {
        DamageRule::Standard => damage,
        DamageRule::Bounded => damage.min(remaining_health),
    }
}

pub fn compute_damage(
    attack: AttackProfile,
    defense: DefenseProfile,
    rule: DamageRule,
    rng: &mut GameRng,
) -> u32 {
    if !rng.roll_percent(hit_chance_percent(attack.level, defense.level)) {
        return 0;
    }
    let base = rng.roll_range(attack.min_damage, attack.max_damage);
    resolve_damage(base, defense.defense, rule, defense.remaining_health)
}
