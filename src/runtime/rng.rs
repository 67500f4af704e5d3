use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Small seedable LCG. Every simulation subsystem owns its own stream so
/// tests can pin outcomes with `from_seed`.
#[derive(Debug, Clone, Copy)]
pub struct GameRng {
    state: u64,
}

impl GameRng {
    pub fn from_time() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos() as u64)
            .unwrap_or(DEFAULT_SEED);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: u64) -> Self {
        let seed = if seed == 0 { DEFAULT_SEED } else { seed };
        Self { state: seed }
    }

    fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.state >> 32) as u32
    }

    /// Inclusive on both ends; a reversed range collapses to `min`.
    pub fn roll_range(&mut self, min: u32, max: u32) -> u32 {
        let (min, max) = if min >= max { (min, min) } else { (min, max) };
        let span = u64::from(max - min) + 1;
        let value = u64::from(self.next_u32()) % span;
        min + value as u32
    }

    pub fn roll_percent(&mut self, chance: u32) -> bool {
        let chance = chance.min(100);
        self.next_u32() % 100 < chance
    }

    pub fn roll_per_mille(&mut self, chance: u16) -> bool {
        let chance = u32::from(chance.min(1000));
        self.next_u32() % 1000 < chance
    }

    /// Uniform value in `[0, 1)`.
    pub fn roll_unit(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }
}

impl Default for GameRng {
    fn default() -> Self {
        Self::from_seed(DEFAULT_SEED)
    }
}
