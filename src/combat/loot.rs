use crate::entities::drop::DropPayload;
use crate::entities::template::LootEntry;
use crate::runtime::rng::GameRng;

/// One roll per table entry; each entry drops independently.
pub fn roll_loot(table: &[LootEntry], rng: &mut GameRng) -> Vec<DropPayload> {
    let mut drops = Vec::new();
    for entry in table {
        if !rng.roll_per_mille(entry.chance) {
            continue;
        }
        let count = rng.roll_range(
            u32::from(entry.count_min.max(1)),
            u32::from(entry.count_max.max(entry.count_min).max(1)),
        );
        drops.push(DropPayload {
            item: entry.item,
            count: count.min(u32::from(u16::MAX)) as u16,
        });
    }
    drops
}
