use serde::{Deserialize, Serialize};

/// Health pool shared by entities and characters. Callers serialize access
/// through the owner's state lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vitals {
    pub health: u32,
    pub max_health: u32,
}

impl Vitals {
    pub fn full(max_health: u32) -> Self {
        Self {
            health: max_health,
            max_health,
        }
    }

    pub fn is_depleted(&self) -> bool {
        self.health == 0
    }

    /// Returns the amount actually removed; health never goes below zero.
    pub fn apply_raw_damage(&mut self, amount: u32) -> u32 {
        let applied = amount.min(self.health);
        self.health = self.health.saturating_sub(applied);
        applied
    }

    pub fn apply_heal(&mut self, amount: u32) -> u32 {
        if self.max_health == 0 {
            return 0;
        }
        let before = self.health;
        let new = before.saturating_add(amount).min(self.max_health);
        self.health = new;
        new.saturating_sub(before)
    }

    pub fn reset(&mut self) {
        self.health = self.max_health;
    }

    pub fn percent(&self) -> u8 {
        if self.max_health == 0 {
            return 0;
        }
        let percent = u64::from(self.health) * 100 / u64::from(self.max_health);
        percent.min(100) as u8
    }
}
