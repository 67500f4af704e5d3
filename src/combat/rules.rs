use crate::combat::damage::DamageRule;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CombatRules {
    pub pvp_enabled: bool,
    pub damage_rule: DamageRule,
    /// Reach of a character's direct attack.
    pub melee_range: f32,
    pub drop_expiry: Duration,
    pub claim_duration: Duration,
}

impl Default for CombatRules {
    fn default() -> Self {
        Self {
            pvp_enabled: true,
            damage_rule: DamageRule::Standard,
            melee_range: 1.5,
            drop_expiry: Duration::from_secs(60),
            claim_duration: Duration::from_secs(15),
        }
    }
}
