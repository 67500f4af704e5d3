pub mod behavior;
pub mod behavior_rules;
pub mod loader;
pub mod observer;
pub mod position;
pub mod presentation;
pub mod registry;
pub mod sectors;
pub mod visibility;
