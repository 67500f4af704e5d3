use crate::entities::creature::TargetRef;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Process-wide enqueue order; lower means declared earlier.
pub fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingHit {
    pub sequence: u64,
    pub target: TargetRef,
    pub damage: u32,
}

/// Hits a character has declared but not yet applied.
#[derive(Debug, Default)]
pub struct CombatTargetQueue {
    hits: Vec<PendingHit>,
}

impl CombatTargetQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target: TargetRef, damage: u32) -> PendingHit {
        let hit = PendingHit {
            sequence: next_sequence(),
            target,
            damage,
        };
        self.hits.push(hit);
        hit
    }

    /// Empties the queue, oldest declaration first.
    pub fn drain_ordered(&mut self) -> Vec<PendingHit> {
        let mut hits = std::mem::take(&mut self.hits);
        hits.sort_by_key(|hit| hit.sequence);
        hits
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }
}
