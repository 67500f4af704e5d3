use crate::entities::creature::PresentationId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Holders {
    live: bool,
    views: u32,
}

/// Per-map pool of 16-bit presentation ids. An id stays allocated while it
/// is the live id of some entity or while any observer still has it in view.
#[derive(Debug)]
pub struct PresentationPool {
    capacity: u16,
    words: Vec<u64>,
    holders: HashMap<u16, Holders>,
}

impl PresentationPool {
    /// Ids run from 1 to `capacity`; 0 is never handed out.
    pub fn new(capacity: u16) -> Self {
        let capacity = capacity.max(1);
        let bits = usize::from(capacity) + 1;
        let mut words = vec![0u64; bits.div_ceil(64)];
        words[0] |= 1;
        // Bits past the capacity are permanently taken.
        for bit in bits..words.len() * 64 {
            words[bit / 64] |= 1 << (bit % 64);
        }
        Self {
            capacity,
            words,
            holders: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.holders.len()
    }

    pub fn is_allocated(&self, id: PresentationId) -> bool {
        self.holders.contains_key(&id.0)
    }

    pub fn is_live(&self, id: PresentationId) -> bool {
        self.holders.get(&id.0).map(|h| h.live).unwrap_or(false)
    }

    /// Lowest free id, marked live.
    pub fn allocate(&mut self) -> Option<PresentationId> {
        let (index, word) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let bit = word.trailing_ones() as usize;
        let id = index * 64 + bit;
        self.words[index] |= 1 << bit;
        self.holders.insert(
            id as u16,
            Holders {
                live: true,
                views: 0,
            },
        );
        Some(PresentationId(id as u16))
    }

    pub fn retain_view(&mut self, id: PresentationId) -> bool {
        match self.holders.get_mut(&id.0) {
            Some(holders) => {
                holders.views += 1;
                true
            }
            None => false,
        }
    }

    /// Returns true when this release freed the id.
    pub fn release_view(&mut self, id: PresentationId) -> bool {
        let Some(holders) = self.holders.get_mut(&id.0) else {
            return false;
        };
        holders.views = holders.views.saturating_sub(1);
        self.free_if_unheld(id)
    }

    /// The owner no longer uses the id; it frees once no view holds it.
    pub fn retire(&mut self, id: PresentationId) -> bool {
        let Some(holders) = self.holders.get_mut(&id.0) else {
            return false;
        };
        holders.live = false;
        self.free_if_unheld(id)
    }

    fn free_if_unheld(&mut self, id: PresentationId) -> bool {
        match self.holders.get(&id.0) {
            Some(holders) if !holders.live && holders.views == 0 => {
                self.holders.remove(&id.0);
                let bit = usize::from(id.0);
                self.words[bit / 64] &= !(1 << (bit % 64));
                true
            }
            _ => false,
        }
    }
}
