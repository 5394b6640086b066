//! Component definitions stored in the entity registry.
//!
//! Components are pure data. Behavior lives in systems.

mod entity;
mod lifecycle;
mod quantity;

pub use entity::*;
pub use lifecycle::*;
pub use quantity::*;
