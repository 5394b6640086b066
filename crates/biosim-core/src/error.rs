//! Error taxonomy for loading and running simulations.
//!
//! Load-time problems (`Configuration`) abort startup. Run-time problems
//! (`InvariantViolation`, `Numeric`, `UnknownEntity`) are recovered per tick
//! by the engine and surfaced as events in the tick report.

use thiserror::Error;

use crate::components::{EntityId, Unit};

/// Errors produced by the simulation core
#[derive(Debug, Error)]
pub enum SimError {
    /// Malformed or inconsistent scenario definitions
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A proposed mutation would break a data invariant
    #[error("invariant violation in mutation {index} ({mutation}): {reason}")]
    InvariantViolation {
        index: usize,
        mutation: String,
        reason: String,
    },

    /// A rate function or quantity operation produced a non-finite value
    #[error("numeric error: {0}")]
    Numeric(String),

    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("entity id {0} is already in use")]
    DuplicateId(EntityId),

    #[error("incompatible units for {op}: {lhs} and {rhs}")]
    IncompatibleUnits {
        op: &'static str,
        lhs: Unit,
        rhs: Unit,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("save version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

impl SimError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SimError::Configuration(msg.into())
    }
}

impl From<Box<bincode::ErrorKind>> for SimError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        SimError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        SimError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for SimError {
    fn from(e: toml::de::Error) -> Self {
        SimError::Configuration(e.to_string())
    }
}

/// Result alias used throughout the crate
pub type SimResult<T> = Result<T, SimError>;
