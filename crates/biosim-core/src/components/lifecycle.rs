//! Lifecycle states and the per-kind state machines that constrain them.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::EntityKind;

/// Lifecycle state of an entity. Which states are reachable depends on the
/// entity kind (see [`StateMachine`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    // Molecule pools
    Stable,

    // Cells
    Progenitor,
    Differentiating,
    Mature,
    Apoptotic,

    // Tissue remodeling sites
    Quiescent,
    Active,
    Resorbing,
    Reversal,
    Forming,
    Mineralizing,
}

impl LifecycleState {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleState::Stable => "stable",
            LifecycleState::Progenitor => "progenitor",
            LifecycleState::Differentiating => "differentiating",
            LifecycleState::Mature => "mature",
            LifecycleState::Apoptotic => "apoptotic",
            LifecycleState::Quiescent => "quiescent",
            LifecycleState::Active => "active",
            LifecycleState::Resorbing => "resorbing",
            LifecycleState::Reversal => "reversal",
            LifecycleState::Forming => "forming",
            LifecycleState::Mineralizing => "mineralizing",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared states and legal edges for one entity kind
#[derive(Debug)]
pub struct StateMachine {
    pub initial: LifecycleState,
    pub states: &'static [LifecycleState],
    pub edges: &'static [(LifecycleState, LifecycleState)],
}

use self::LifecycleState::*;

static MOLECULE: StateMachine = StateMachine {
    initial: Stable,
    states: &[Stable],
    edges: &[],
};

static CELL: StateMachine = StateMachine {
    initial: Progenitor,
    states: &[Progenitor, Differentiating, Mature, Apoptotic],
    edges: &[
        (Progenitor, Differentiating),
        (Differentiating, Mature),
        (Mature, Apoptotic),
        (Progenitor, Apoptotic),
        (Differentiating, Apoptotic),
    ],
};

static TISSUE_SITE: StateMachine = StateMachine {
    initial: Quiescent,
    states: &[Quiescent, Active, Resorbing, Reversal, Forming, Mineralizing],
    edges: &[
        (Quiescent, Active),
        (Active, Resorbing),
        (Resorbing, Reversal),
        (Reversal, Forming),
        (Forming, Mineralizing),
        (Mineralizing, Quiescent),
    ],
};

impl StateMachine {
    pub fn for_kind(kind: EntityKind) -> &'static StateMachine {
        match kind {
            EntityKind::Molecule => &MOLECULE,
            EntityKind::Cell => &CELL,
            EntityKind::TissueSite => &TISSUE_SITE,
        }
    }

    pub fn contains(&self, state: LifecycleState) -> bool {
        self.states.contains(&state)
    }

    pub fn allows(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.edges.contains(&(from, to))
    }

    /// States reachable in one step from `from`
    pub fn successors(&self, from: LifecycleState) -> impl Iterator<Item = LifecycleState> + '_ {
        self.edges
            .iter()
            .filter(move |(a, _)| *a == from)
            .map(|(_, b)| *b)
    }
}
