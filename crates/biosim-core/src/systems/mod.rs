//! Systems - per-tick logic that reads the registry snapshot and proposes
//! mutations

mod contention;
mod lifecycle_rules;
mod plan;
mod process;
mod rate_law;
mod regulation;

pub use contention::*;
pub use lifecycle_rules::*;
pub use plan::*;
pub use process::*;
pub use rate_law::*;
pub use regulation::*;
