//! Generation - procedural creation of initial populations

mod population;

pub use population::*;
