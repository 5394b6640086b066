//! Entity registry - the sole owner of mutable entity state.
//!
//! Entities live in a `hecs` world as (`Identity`, `Quantities`, `Lifecycle`)
//! component bundles, addressed externally by stable [`EntityId`]s. Nothing
//! outside the registry holds a mutable reference: reads go through copied
//! [`EntityView`]s and writes go through all-or-nothing transactions.

use hecs::World;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::components::*;
use crate::error::{SimError, SimResult};

/// Relative slack under which a conserved value that lands just below zero
/// (floating-point residue from proportional scaling) is snapped to zero.
const NEGATIVE_SNAP: f64 = 1e-12;

/// One proposed change to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Add `delta` to a quantity; the unit must match the stored one
    Adjust {
        entity: EntityId,
        quantity: String,
        delta: Quantity,
    },
    /// Overwrite a quantity; the unit must match the stored one
    Set {
        entity: EntityId,
        quantity: String,
        value: Quantity,
    },
    Transition {
        entity: EntityId,
        to: LifecycleState,
    },
    Spawn(EntitySpec),
    Remove {
        entity: EntityId,
    },
}

impl Mutation {
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Mutation::Adjust { entity, .. }
            | Mutation::Set { entity, .. }
            | Mutation::Transition { entity, .. }
            | Mutation::Remove { entity } => Some(*entity),
            Mutation::Spawn(spec) => spec.id,
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Adjust {
                entity,
                quantity,
                delta,
            } => write!(f, "adjust {}.{} by {}", entity, quantity, delta),
            Mutation::Set {
                entity,
                quantity,
                value,
            } => write!(f, "set {}.{} to {}", entity, quantity, value),
            Mutation::Transition { entity, to } => write!(f, "transition {} to {}", entity, to),
            Mutation::Spawn(spec) => write!(f, "spawn {}", spec.type_name),
            Mutation::Remove { entity } => write!(f, "remove {}", entity),
        }
    }
}

/// What a committed transaction changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionReceipt {
    pub spawned: Vec<EntityId>,
    pub removed: Vec<EntityId>,
    pub transitions: Vec<(EntityId, LifecycleState, LifecycleState)>,
}

/// Immutable copy of every live entity, ordered by id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    entities: BTreeMap<EntityId, EntityView>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: EntityId) -> Option<&EntityView> {
        self.entities.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityView> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Live entities of one type, ascending by id
    pub fn of_type<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a EntityView> + 'a {
        self.entities
            .values()
            .filter(move |e| e.type_name == type_name)
    }

    /// The oldest live entity of a type, used to resolve shared pools
    pub fn first_of_type(&self, type_name: &str) -> Option<&EntityView> {
        self.entities.values().find(|e| e.type_name == type_name)
    }
}

/// Store of all live entities
pub struct EntityRegistry {
    world: World,
    index: BTreeMap<EntityId, hecs::Entity>,
    retired: BTreeSet<EntityId>,
    next_id: u64,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            world: World::new(),
            index: BTreeMap::new(),
            retired: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Rebuild a registry with a known id history (used when reloading state)
    pub fn with_history(next_id: u64, retired: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            next_id: next_id.max(1),
            retired: retired.into_iter().collect(),
            ..Self::new()
        }
    }

    /// Register a new entity. Fails with `DuplicateId` only when the caller
    /// supplies an explicit id that is live or was used earlier in the run.
    pub fn register(&mut self, spec: EntitySpec, now: f64) -> SimResult<EntityId> {
        if let Some(id) = spec.id {
            if self.is_taken(id) {
                return Err(SimError::DuplicateId(id));
            }
        }
        if let Err(reason) = validate_spec(&spec) {
            return Err(SimError::InvariantViolation {
                index: 0,
                mutation: format!("register {}", spec.type_name),
                reason,
            });
        }
        Ok(self.insert(spec, now))
    }

    pub fn get_snapshot(&self, id: EntityId) -> SimResult<EntityView> {
        let entity = *self.index.get(&id).ok_or(SimError::UnknownEntity(id))?;
        self.view_of(id, entity)
    }

    /// Copy every live entity into an immutable snapshot
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut entities = BTreeMap::new();
        for (_, (identity, quantities, lifecycle)) in self
            .world
            .query::<(&Identity, &Quantities, &Lifecycle)>()
            .iter()
        {
            entities.insert(
                identity.id,
                EntityView {
                    id: identity.id,
                    type_name: identity.type_name.clone(),
                    kind: identity.kind,
                    lifecycle: *lifecycle,
                    quantities: quantities.clone(),
                },
            );
        }
        RegistrySnapshot { entities }
    }

    /// Destroy an entity; later reads fail with `UnknownEntity`
    pub fn remove(&mut self, id: EntityId) -> SimResult<()> {
        let entity = self.index.remove(&id).ok_or(SimError::UnknownEntity(id))?;
        self.world
            .despawn(entity)
            .map_err(|_| SimError::UnknownEntity(id))?;
        self.retired.insert(id);
        log::debug!("Removed entity {}", id);
        Ok(())
    }

    /// Apply a batch atomically. Every mutation is staged against copies
    /// first; the first failure names the offending mutation and leaves the
    /// registry untouched.
    pub fn apply_transaction(
        &mut self,
        mutations: &[Mutation],
        now: f64,
    ) -> SimResult<TransactionReceipt> {
        let mut staged: BTreeMap<EntityId, EntityView> = BTreeMap::new();
        let mut removed: BTreeSet<EntityId> = BTreeSet::new();
        let mut spawns: Vec<EntitySpec> = Vec::new();
        let mut reserved: BTreeSet<EntityId> = BTreeSet::new();
        // Auto ids are fixed while staging so a later explicit id in the
        // same batch cannot claim one of them
        let mut next_auto = self.next_id;
        let mut transitions = Vec::new();

        for (index, mutation) in mutations.iter().enumerate() {
            let violation = |reason: String| SimError::InvariantViolation {
                index,
                mutation: mutation.to_string(),
                reason,
            };

            match mutation {
                Mutation::Adjust {
                    entity,
                    quantity,
                    delta,
                } => {
                    let view = self
                        .stage(&mut staged, &removed, *entity)
                        .map_err(|_| violation(format!("unknown entity {}", entity)))?;
                    let current = view
                        .quantities
                        .get(quantity)
                        .ok_or_else(|| violation(format!("{} has no quantity '{}'", entity, quantity)))?;
                    let sum = current
                        .checked_add(*delta)
                        .map_err(|err| violation(err.to_string()))?;
                    let next = settle(
                        sum.value,
                        current.value,
                        view.quantities.is_conserved(quantity),
                    )
                    .map_err(|reason| violation(format!("{}.{} {}", entity, quantity, reason)))?;
                    view.quantities.set_value(quantity, next);
                }
                Mutation::Set {
                    entity,
                    quantity,
                    value,
                } => {
                    let view = self
                        .stage(&mut staged, &removed, *entity)
                        .map_err(|_| violation(format!("unknown entity {}", entity)))?;
                    let current = view
                        .quantities
                        .get(quantity)
                        .ok_or_else(|| violation(format!("{} has no quantity '{}'", entity, quantity)))?;
                    if current.unit != value.unit {
                        return Err(violation(format!(
                            "unit {} does not match stored unit {}",
                            value.unit, current.unit
                        )));
                    }
                    let next = settle(
                        value.value,
                        current.value,
                        view.quantities.is_conserved(quantity),
                    )
                    .map_err(|reason| violation(format!("{}.{} {}", entity, quantity, reason)))?;
                    view.quantities.set_value(quantity, next);
                }
                Mutation::Transition { entity, to } => {
                    let view = self
                        .stage(&mut staged, &removed, *entity)
                        .map_err(|_| violation(format!("unknown entity {}", entity)))?;
                    let from = view.lifecycle.state;
                    if !view.kind.lifecycle().allows(from, *to) {
                        return Err(violation(format!(
                            "illegal {} transition {} -> {}",
                            view.kind, from, to
                        )));
                    }
                    view.lifecycle = Lifecycle {
                        state: *to,
                        entered_at: now,
                    };
                    transitions.push((*entity, from, *to));
                }
                Mutation::Spawn(spec) => {
                    let id = match spec.id {
                        Some(id) => {
                            if self.is_taken(id) || reserved.contains(&id) {
                                return Err(violation(format!(
                                    "entity id {} is already in use",
                                    id
                                )));
                            }
                            id
                        }
                        None => {
                            while self.is_taken(EntityId(next_auto))
                                || reserved.contains(&EntityId(next_auto))
                            {
                                next_auto += 1;
                            }
                            EntityId(next_auto)
                        }
                    };
                    validate_spec(spec).map_err(violation)?;
                    reserved.insert(id);
                    spawns.push(EntitySpec {
                        id: Some(id),
                        ..spec.clone()
                    });
                }
                Mutation::Remove { entity } => {
                    if removed.contains(entity) || !self.index.contains_key(entity) {
                        return Err(violation(format!("unknown entity {}", entity)));
                    }
                    staged.remove(entity);
                    removed.insert(*entity);
                }
            }
        }

        // Commit
        for (id, view) in staged {
            if let Some(&entity) = self.index.get(&id) {
                if let Ok(mut q) = self.world.get::<&mut Quantities>(entity) {
                    *q = view.quantities;
                }
                if let Ok(mut l) = self.world.get::<&mut Lifecycle>(entity) {
                    *l = view.lifecycle;
                }
            }
        }

        let mut receipt = TransactionReceipt {
            transitions,
            ..Default::default()
        };
        for id in removed {
            if let Some(entity) = self.index.remove(&id) {
                if let Err(err) = self.world.despawn(entity) {
                    log::warn!("Entity {} had no world record to despawn: {}", id, err);
                }
                self.retired.insert(id);
                receipt.removed.push(id);
            }
        }
        for spec in spawns {
            receipt.spawned.push(self.insert(spec, now));
        }

        Ok(receipt)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Live ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.index.keys().copied()
    }

    /// Next id the allocator will hand out
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn retired(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.retired.iter().copied()
    }

    fn is_taken(&self, id: EntityId) -> bool {
        self.index.contains_key(&id) || self.retired.contains(&id)
    }

    fn insert(&mut self, spec: EntitySpec, now: f64) -> EntityId {
        let id = match spec.id {
            Some(id) => id,
            None => EntityId(self.next_id),
        };
        self.next_id = self.next_id.max(id.0 + 1);

        let entity = self.world.spawn((
            Identity {
                id,
                type_name: spec.type_name,
                kind: spec.kind,
            },
            spec.quantities,
            Lifecycle {
                state: spec.state,
                entered_at: spec.entered_at.unwrap_or(now),
            },
        ));
        self.index.insert(id, entity);
        id
    }

    fn view_of(&self, id: EntityId, entity: hecs::Entity) -> SimResult<EntityView> {
        let unknown = |_| SimError::UnknownEntity(id);
        let identity = self.world.get::<&Identity>(entity).map_err(unknown)?;
        let quantities = self.world.get::<&Quantities>(entity).map_err(unknown)?;
        let lifecycle = self.world.get::<&Lifecycle>(entity).map_err(unknown)?;
        Ok(EntityView {
            id,
            type_name: identity.type_name.clone(),
            kind: identity.kind,
            lifecycle: *lifecycle,
            quantities: (*quantities).clone(),
        })
    }

    fn stage<'a>(
        &self,
        staged: &'a mut BTreeMap<EntityId, EntityView>,
        removed: &BTreeSet<EntityId>,
        id: EntityId,
    ) -> SimResult<&'a mut EntityView> {
        if removed.contains(&id) {
            return Err(SimError::UnknownEntity(id));
        }
        match staged.entry(id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let view = self.get_snapshot(id)?;
                Ok(e.insert(view))
            }
        }
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a proposed value against the conservation invariant
fn settle(next: f64, current: f64, conserved: bool) -> Result<f64, String> {
    if !next.is_finite() {
        return Err(format!("would become non-finite ({})", next));
    }
    if conserved && next < 0.0 {
        if next >= -NEGATIVE_SNAP * current.abs().max(1.0) {
            return Ok(0.0);
        }
        return Err(format!("would drive conserved quantity negative ({})", next));
    }
    Ok(next)
}

fn validate_spec(spec: &EntitySpec) -> Result<(), String> {
    let machine = spec.kind.lifecycle();
    if !machine.contains(spec.state) {
        return Err(format!(
            "state {} is not part of the {} lifecycle",
            spec.state, spec.kind
        ));
    }
    if let Some((name, value)) = spec.quantities.first_invalid() {
        return Err(format!(
            "initial quantity '{}' is invalid ({})",
            name, value
        ));
    }
    Ok(())
}
