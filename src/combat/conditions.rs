use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Poison,
    Fire,
    Energy,
    Bleed,
    Regeneration,
}

impl ConditionKind {
    pub fn heals(self) -> bool {
        matches!(self, ConditionKind::Regeneration)
    }
}

/// Declarative periodic effect, as found in templates and skill tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ConditionSpec {
    pub kind: ConditionKind,
    pub tick_amount: u32,
    pub interval_ms: u64,
    pub ticks: u32,
}

/// Running periodic effect. Owned by the scheduled task that applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionInstance {
    pub kind: ConditionKind,
    pub tick_amount: u32,
    pub interval: Duration,
    pub remaining_ticks: u32,
}

impl ConditionInstance {
    pub fn new(spec: ConditionSpec) -> Self {
        Self {
            kind: spec.kind,
            tick_amount: spec.tick_amount,
            interval: Duration::from_millis(spec.interval_ms.max(1)),
            remaining_ticks: spec.ticks,
        }
    }

    /// Consumes one tick and returns its amount, or `None` once exhausted.
    pub fn next_tick(&mut self) -> Option<u32> {
        if self.remaining_ticks == 0 {
            return None;
        }
        self.remaining_ticks -= 1;
        Some(self.tick_amount)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_ticks == 0
    }

    pub fn merge_from(&mut self, other: ConditionInstance) {
        if self.kind != other.kind {
            return;
        }
        self.remaining_ticks = self.remaining_ticks.max(other.remaining_ticks);
        self.tick_amount = self.tick_amount.max(other.tick_amount);
        self.interval = self.interval.min(other.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poison(ticks: u32, amount: u32) -> ConditionInstance {
        ConditionInstance::new(ConditionSpec {
            kind: ConditionKind::Poison,
            tick_amount: amount,
            interval_ms: 1000,
            ticks,
        })
    }

    #[test]
    fn ticks_until_exhausted() {
        let mut condition = poison(3, 4);
        assert_eq!(condition.next_tick(), Some(4));
        assert_eq!(condition.next_tick(), Some(4));
        assert!(!condition.is_expired());
        assert_eq!(condition.next_tick(), Some(4));
        assert!(condition.is_expired());
        assert_eq!(condition.next_tick(), None);
    }

    #[test]
    fn merge_keeps_the_stronger_effect() {
        let mut condition = poison(2, 4);
        condition.merge_from(poison(5, 3));
        assert_eq!(condition.remaining_ticks, 5);
        assert_eq!(condition.tick_amount, 4);
        let mut regen = ConditionInstance::new(ConditionSpec {
            kind: ConditionKind::Regeneration,
            tick_amount: 1,
            interval_ms: 10,
            ticks: 1,
        });
        regen.merge_from(poison(9, 9));
        assert_eq!(regen.remaining_ticks, 1);
        assert!(regen.kind.heals());
    }
}
