pub mod character;
pub mod creature;
pub mod drop;
pub mod entity;
pub mod stats;
pub mod template;
