//! Entity identity, quantities and the read-only view handed to systems.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::{LifecycleState, Quantity, StateMachine};

/// Stable identifier, never reused within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Closed set of biological actor kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Molecule,
    Cell,
    TissueSite,
}

impl EntityKind {
    pub fn lifecycle(self) -> &'static StateMachine {
        StateMachine::for_kind(self)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Molecule => "molecule",
            EntityKind::Cell => "cell",
            EntityKind::TissueSite => "tissueSite",
        };
        f.write_str(name)
    }
}

/// Identity component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: EntityId,
    pub type_name: String,
    pub kind: EntityKind,
}

/// Lifecycle component
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Lifecycle {
    pub state: LifecycleState,
    /// Simulation time (s) at which `state` was entered
    pub entered_at: f64,
}

impl Lifecycle {
    pub fn time_in_state(&self, now: f64) -> f64 {
        (now - self.entered_at).max(0.0)
    }
}

/// Named quantities held by an entity, plus the set of names that form
/// conserved (never negative) pools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quantities {
    values: BTreeMap<String, Quantity>,
    conserved: BTreeSet<String>,
}

impl Quantities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a quantity; concentration and mass quantities become conserved
    pub fn insert(&mut self, name: impl Into<String>, quantity: Quantity) {
        let name = name.into();
        if quantity.unit.is_conserved() {
            self.conserved.insert(name.clone());
        }
        self.values.insert(name, quantity);
    }

    pub fn with(mut self, name: impl Into<String>, quantity: Quantity) -> Self {
        self.insert(name, quantity);
        self
    }

    /// Mark an existing quantity as conserved regardless of unit
    pub fn mark_conserved(&mut self, name: &str) -> bool {
        if self.values.contains_key(name) {
            self.conserved.insert(name.to_string());
            true
        } else {
            false
        }
    }

    pub fn get(&self, name: &str) -> Option<Quantity> {
        self.values.get(name).copied()
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).map(|q| q.value)
    }

    pub(crate) fn set_value(&mut self, name: &str, value: f64) -> bool {
        match self.values.get_mut(name) {
            Some(q) => {
                q.value = value;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn is_conserved(&self, name: &str) -> bool {
        self.conserved.contains(name)
    }

    pub fn conserved_names(&self) -> impl Iterator<Item = &str> {
        self.conserved.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First conserved quantity holding a negative or non-finite value
    pub fn first_invalid(&self) -> Option<(&str, f64)> {
        self.values.iter().find_map(|(name, q)| {
            let bad = !q.value.is_finite() || (self.conserved.contains(name) && q.value < 0.0);
            bad.then_some((name.as_str(), q.value))
        })
    }
}

/// Read-only copy of one entity's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub id: EntityId,
    pub type_name: String,
    pub kind: EntityKind,
    pub lifecycle: Lifecycle,
    pub quantities: Quantities,
}

impl EntityView {
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state
    }

    pub fn value(&self, quantity: &str) -> Option<f64> {
        self.quantities.value(quantity)
    }
}

/// Everything needed to register a new entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    /// Explicit id; `None` lets the registry allocate one
    pub id: Option<EntityId>,
    pub type_name: String,
    pub kind: EntityKind,
    pub state: LifecycleState,
    /// Time the initial state was entered; `None` means registration time
    pub entered_at: Option<f64>,
    pub quantities: Quantities,
}

impl EntitySpec {
    pub fn new(type_name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id: None,
            type_name: type_name.into(),
            kind,
            state: kind.lifecycle().initial,
            entered_at: None,
            quantities: Quantities::new(),
        }
    }

    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_state(mut self, state: LifecycleState) -> Self {
        self.state = state;
        self
    }

    pub fn with_quantity(mut self, name: impl Into<String>, quantity: Quantity) -> Self {
        self.quantities.insert(name, quantity);
        self
    }
}
