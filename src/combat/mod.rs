pub mod conditions;
pub mod damage;
pub mod loot;
pub mod queue;
pub mod resolution;
pub mod rules;
