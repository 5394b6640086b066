//! biosim core - biological process simulation engine
//!
//! A deterministic, tick-based simulator for stateful multi-actor
//! physiology models: bone remodeling cycles, mineral homeostasis
//! feedback, enzymatic reaction kinetics.
//!
//! # Architecture
//!
//! Entities live in an ECS world via `hecs`, behind the `EntityRegistry`:
//! - **Components**: identity, typed quantities, lifecycle state
//! - **Systems**: rate laws, process evaluation, contention, lifecycle
//!   rules, regulatory feedback; all read one immutable snapshot per tick
//! - **Engine**: commits every proposed change as a single atomic
//!   transaction and emits a report per tick
//!
//! # Example
//!
//! ```rust,no_run
//! use biosim_core::prelude::*;
//!
//! let mut engine = SimulationEngine::from_path("data/calcium_homeostasis.toml")?;
//! let mut sink = MemorySink::new();
//! let summary = engine.run_ticks(10, &mut sink)?;
//! println!("{} ticks, {} recovered errors", summary.ticks, summary.errors);
//! # Ok::<(), biosim_core::SimError>(())
//! ```

pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod persistence;
pub mod registry;
pub mod relations;
pub mod report;
pub mod scheduler;
pub mod systems;

pub use error::{SimError, SimResult};

/// Commonly used types for convenient importing
pub mod prelude {
    pub use crate::components::*;
    pub use crate::config::{Definitions, ScenarioConfig};
    pub use crate::engine::SimulationEngine;
    pub use crate::error::{SimError, SimResult};
    pub use crate::registry::{EntityRegistry, Mutation, RegistrySnapshot};
    pub use crate::report::{
        EntityRecord, EventKind, JsonLinesSink, MemorySink, NullSink, ReportSink, TickEvent,
        TickReport,
    };
    pub use crate::scheduler::{CancelHandle, RunSummary, StopReason, TickMode};
    pub use crate::systems::{ContentionPolicy, RateLaw, RegulatoryPhase};
}
