//! Competing demand on shared conserved pools within one tick.
//!
//! Demand is measured against the snapshot value only; production by other
//! processes in the same tick is not available until the next tick.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::process::Instance;
use crate::components::EntityId;
use crate::registry::RegistrySnapshot;
use crate::report::{EventKind, TickEvent};

/// How an oversubscribed pool is shared out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentionPolicy {
    /// Scale every consumer of an oversubscribed pool by
    /// `available / demand`; an instance touching several such pools takes
    /// the smallest factor so its stoichiometry stays intact.
    #[default]
    Proportional,
    /// Drop every consumer of an oversubscribed pool for this tick
    Reject,
}

/// Apply the policy in place and report what was clamped or dropped
pub fn resolve<'a>(
    instances: &mut Vec<Instance>,
    snapshot: &RegistrySnapshot,
    policy: ContentionPolicy,
    process_name: impl Fn(usize) -> &'a str,
) -> Vec<TickEvent> {
    let mut demand: BTreeMap<(EntityId, String), f64> = BTreeMap::new();
    for instance in instances.iter() {
        for d in instance.deltas.iter().filter(|d| d.conserved && d.amount < 0.0) {
            *demand.entry((d.entity, d.quantity.clone())).or_insert(0.0) -= d.amount;
        }
    }

    let mut factors: BTreeMap<(EntityId, String), f64> = BTreeMap::new();
    for ((entity, quantity), need) in demand {
        let available = snapshot
            .get(entity)
            .and_then(|e| e.value(&quantity))
            .unwrap_or(0.0)
            .max(0.0);
        if need > available {
            factors.insert((entity, quantity), available / need);
        }
    }
    if factors.is_empty() {
        return Vec::new();
    }

    let factor_for = |instance: &Instance| -> Option<f64> {
        instance
            .deltas
            .iter()
            .filter(|d| d.conserved && d.amount < 0.0)
            .filter_map(|d| factors.get(&(d.entity, d.quantity.clone())).copied())
            .reduce(f64::min)
    };

    let mut events = Vec::new();
    match policy {
        ContentionPolicy::Proportional => {
            for instance in instances.iter_mut() {
                if let Some(factor) = factor_for(&*instance) {
                    instance.scale(factor);
                    events.push(
                        TickEvent::new(
                            EventKind::Contention,
                            format!(
                                "{} scaled to {:.4} of demand on a shared pool",
                                process_name(instance.process),
                                factor
                            ),
                        )
                        .with_source(process_name(instance.process))
                        .with_entity(instance.subject),
                    );
                }
            }
        }
        ContentionPolicy::Reject => {
            instances.retain(|instance| {
                if factor_for(instance).is_some() {
                    events.push(
                        TickEvent::new(
                            EventKind::InvariantViolation,
                            format!(
                                "{} dropped: combined demand exceeds an available pool",
                                process_name(instance.process)
                            ),
                        )
                        .with_source(process_name(instance.process))
                        .with_entity(instance.subject),
                    );
                    false
                } else {
                    true
                }
            });
        }
    }

    for ((entity, quantity), factor) in &factors {
        log::debug!(
            "Pool {}.{} oversubscribed, factor {:.4} ({:?})",
            entity,
            quantity,
            factor,
            policy
        );
    }
    events
}
