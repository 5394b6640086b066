//! Process engine - evaluates every eligible process instance against the
//! prior-tick snapshot and turns rates into quantity deltas.
//!
//! One instance runs per live entity of the process's subject type.
//! Evaluation reads only the immutable snapshot, so instances can be
//! computed in any order (or in parallel) with identical results.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::contention::{self, ContentionPolicy};
use super::plan::{Contribution, Origin, TickPlan};
use super::RateLaw;
use crate::components::{EntityId, EntityView, LifecycleState, Quantity, Unit};
use crate::registry::{Mutation, RegistrySnapshot};
use crate::report::{EventKind, TickEvent};

/// Reference to a quantity on the subject or on a shared pool entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityRef {
    /// Pool entity type; `None` targets the process subject. A pool
    /// resolves to the lowest-id live entity of that type.
    #[serde(default)]
    pub pool: Option<String>,
    pub quantity: String,
}

impl QuantityRef {
    pub fn subject(quantity: impl Into<String>) -> Self {
        Self {
            pool: None,
            quantity: quantity.into(),
        }
    }

    pub fn pool(entity_type: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self {
            pool: Some(entity_type.into()),
            quantity: quantity.into(),
        }
    }

    /// Entity type this reference lands on, given the subject type
    pub fn entity_type<'a>(&'a self, subject_type: &'a str) -> &'a str {
        self.pool.as_deref().unwrap_or(subject_type)
    }

    /// Find the target entity and current value in a snapshot
    pub fn resolve<'s>(
        &self,
        snapshot: &'s RegistrySnapshot,
        subject: &'s EntityView,
    ) -> Result<(&'s EntityView, f64), String> {
        let target = match &self.pool {
            None => subject,
            Some(pool) => snapshot
                .first_of_type(pool)
                .ok_or_else(|| format!("no live entity of type '{}'", pool))?,
        };
        let value = target.value(&self.quantity).ok_or_else(|| {
            format!("{} ({}) has no quantity '{}'", target.id, target.type_name, self.quantity)
        })?;
        Ok((target, value))
    }
}

/// A quantity window that must hold for a process to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(flatten)]
    pub target: QuantityRef,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl Requirement {
    pub fn at_least(target: QuantityRef, min: f64) -> Self {
        Self {
            target,
            min: Some(min),
            max: None,
        }
    }

    pub fn holds(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Stoichiometric effect: `coefficient * extent` is added to the target.
/// The coefficient is dimensionless, so the delta carries the process's
/// extent unit and may only land on a quantity of that unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoichTerm {
    #[serde(flatten)]
    pub target: QuantityRef,
    /// Negative coefficients consume
    pub coefficient: f64,
    /// Optional declared unit, checked against the target at load time
    #[serde(default)]
    pub unit: Option<Unit>,
}

impl StoichTerm {
    pub fn new(target: QuantityRef, coefficient: f64) -> Self {
        Self {
            target,
            coefficient,
            unit: None,
        }
    }

    /// Delta this term contributes for a given extent
    pub fn delta(&self, extent: Quantity) -> Result<Quantity, String> {
        extent
            .checked_mul(Quantity::dimensionless(self.coefficient))
            .map_err(|err| err.to_string())
    }
}

/// Immutable process definition, shared read-only across ticks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDef {
    pub name: String,
    /// Entity type each instance is bound to
    pub subject: String,
    pub rate_law: RateLaw,
    /// Unit of the extent (rate x dt) every term scales
    pub unit: Unit,
    pub terms: Vec<StoichTerm>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub cofactor: Option<Requirement>,
    /// Corrective group gating this process; `None` means always on
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub required_state: Option<LifecycleState>,
    /// Evaluation period (s) for slow processes; `None` means every tick
    #[serde(default)]
    pub period: Option<f64>,
}

impl ProcessDef {
    /// Every quantity reference the process reads or writes
    pub fn references(&self) -> impl Iterator<Item = &QuantityRef> {
        self.rate_law
            .substrate()
            .into_iter()
            .chain(self.terms.iter().map(|t| &t.target))
            .chain(self.requirements.iter().map(|r| &r.target))
            .chain(self.cofactor.iter().map(|r| &r.target))
    }
}

/// Inputs that vary per tick
pub struct ProcessContext<'a> {
    pub active_groups: &'a BTreeSet<String>,
    /// Integration step per process; `None` when the process is not due
    pub process_dt: &'a [Option<f64>],
    pub policy: ContentionPolicy,
    pub parallel: bool,
}

/// Quantity change proposed by one instance
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub entity: EntityId,
    pub quantity: String,
    pub amount: f64,
    pub unit: Unit,
    pub conserved: bool,
}

/// One evaluated process instance
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub process: usize,
    pub subject: EntityId,
    pub rate: f64,
    pub extent: f64,
    pub deltas: Vec<Delta>,
}

impl Instance {
    pub fn scale(&mut self, factor: f64) {
        self.extent *= factor;
        for d in &mut self.deltas {
            d.amount *= factor;
        }
    }
}

enum Outcome {
    Fired(Instance),
    Ineligible,
    Skipped(TickEvent),
}

/// Evaluate all due processes and return their contributions
pub fn plan_processes(
    processes: &[ProcessDef],
    snapshot: &RegistrySnapshot,
    ctx: &ProcessContext<'_>,
) -> TickPlan {
    let mut candidates: Vec<(usize, EntityId, f64)> = Vec::new();
    for (pi, process) in processes.iter().enumerate() {
        let Some(dt) = ctx.process_dt.get(pi).copied().flatten() else {
            continue;
        };
        if let Some(group) = &process.group {
            if !ctx.active_groups.contains(group) {
                continue;
            }
        }
        for subject in snapshot.of_type(&process.subject) {
            if process
                .required_state
                .map_or(true, |state| subject.state() == state)
            {
                candidates.push((pi, subject.id, dt));
            }
        }
    }

    let evaluate = |&(pi, subject, dt): &(usize, EntityId, f64)| {
        evaluate_instance(pi, &processes[pi], snapshot, subject, dt)
    };
    let outcomes: Vec<Outcome> = if ctx.parallel {
        candidates.par_iter().map(evaluate).collect()
    } else {
        candidates.iter().map(evaluate).collect()
    };

    let mut plan = TickPlan::default();
    let mut instances = Vec::new();
    for outcome in outcomes {
        match outcome {
            Outcome::Fired(instance) => instances.push(instance),
            Outcome::Ineligible => {}
            Outcome::Skipped(event) => {
                log::warn!("Skipped process instance: {}", event.message);
                plan.events.push(event);
            }
        }
    }

    plan.events.extend(contention::resolve(
        &mut instances,
        snapshot,
        ctx.policy,
        |pi| processes[pi].name.as_str(),
    ));

    for instance in instances {
        let mutations = instance
            .deltas
            .into_iter()
            .filter(|d| d.amount != 0.0)
            .map(|d| Mutation::Adjust {
                entity: d.entity,
                quantity: d.quantity,
                delta: Quantity::new(d.amount, d.unit),
            })
            .collect();
        plan.contributions.push(Contribution {
            origin: Origin::Process {
                name: processes[instance.process].name.clone(),
                subject: instance.subject,
            },
            mutations,
        });
    }
    plan
}

fn evaluate_instance(
    index: usize,
    process: &ProcessDef,
    snapshot: &RegistrySnapshot,
    subject_id: EntityId,
    dt: f64,
) -> Outcome {
    let skipped = |kind: EventKind, message: String| {
        Outcome::Skipped(
            TickEvent::new(kind, message)
                .with_source(&process.name)
                .with_entity(subject_id),
        )
    };

    let Some(subject) = snapshot.get(subject_id) else {
        return skipped(
            EventKind::UnknownEntity,
            format!("{}: subject {} is gone", process.name, subject_id),
        );
    };

    for requirement in process.requirements.iter().chain(process.cofactor.iter()) {
        match requirement.target.resolve(snapshot, subject) {
            Ok((_, value)) if requirement.holds(value) => {}
            Ok(_) => return Outcome::Ineligible,
            Err(reason) => {
                return skipped(EventKind::UnknownEntity, format!("{}: {}", process.name, reason))
            }
        }
    }

    let substrate = match process.rate_law.substrate() {
        Some(r) => match r.resolve(snapshot, subject) {
            Ok((_, value)) => value,
            Err(reason) => {
                return skipped(EventKind::UnknownEntity, format!("{}: {}", process.name, reason))
            }
        },
        None => 0.0,
    };

    let rate = process.rate_law.rate(substrate);
    let extent = rate * dt;
    if !rate.is_finite() || !extent.is_finite() {
        return skipped(
            EventKind::NumericError,
            format!(
                "{}: {} rate is not finite (substrate {}, rate {})",
                process.name,
                process.rate_law.name(),
                substrate,
                rate
            ),
        );
    }
    if extent == 0.0 {
        return Outcome::Ineligible;
    }

    let mut deltas = Vec::with_capacity(process.terms.len());
    for term in &process.terms {
        match term.target.resolve(snapshot, subject) {
            Ok((target, _)) => {
                let stored = target.quantities.get(&term.target.quantity).map(|q| q.unit);
                let delta = match term.delta(Quantity::new(extent, process.unit)) {
                    Ok(delta) if stored == Some(delta.unit) => delta,
                    Ok(delta) => {
                        return skipped(
                            EventKind::InvariantViolation,
                            format!(
                                "{}: {} delta cannot land on '{}'",
                                process.name, delta.unit, term.target.quantity
                            ),
                        )
                    }
                    Err(reason) => {
                        return skipped(
                            EventKind::InvariantViolation,
                            format!("{}: term on '{}': {}", process.name, term.target.quantity, reason),
                        )
                    }
                };
                if !delta.value.is_finite() {
                    return skipped(
                        EventKind::NumericError,
                        format!(
                            "{}: delta on '{}' is not finite ({} x {})",
                            process.name, term.target.quantity, term.coefficient, extent
                        ),
                    );
                }
                deltas.push(Delta {
                    entity: target.id,
                    quantity: term.target.quantity.clone(),
                    amount: delta.value,
                    unit: delta.unit,
                    conserved: target.quantities.is_conserved(&term.target.quantity),
                });
            }
            Err(reason) => {
                return skipped(EventKind::UnknownEntity, format!("{}: {}", process.name, reason))
            }
        }
    }

    Outcome::Fired(Instance {
        process: index,
        subject: subject_id,
        rate,
        extent,
        deltas,
    })
}
