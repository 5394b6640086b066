//! Lifecycle rules - discrete state transitions and their side effects
//! (spawning a new entity, removing the subject).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::plan::{Contribution, Origin, TickPlan};
use crate::components::{EntityView, LifecycleState};
use crate::config::EntityType;
use crate::registry::{Mutation, RegistrySnapshot};
use crate::report::{EventKind, TickEvent};

/// What makes a rule fire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Trigger {
    /// After dwelling `dwell` seconds in the source state
    Timed { dwell: f64 },
    /// When a quantity of the entity leaves a window
    Threshold {
        quantity: String,
        #[serde(default)]
        above: Option<f64>,
        #[serde(default)]
        below: Option<f64>,
    },
    /// While a corrective group is active
    Signal { group: String },
}

/// Side effect fired together with a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Effect {
    /// Register a fresh entity from a type template
    Spawn { entity_type: String },
    /// Destroy the entity that transitioned
    RemoveSubject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub name: String,
    pub entity_type: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub trigger: Trigger,
    #[serde(default)]
    pub effects: Vec<Effect>,
}

impl LifecycleRule {
    pub fn applies_to(&self, entity: &EntityView) -> bool {
        entity.type_name == self.entity_type && entity.state() == self.from
    }

    /// Whether the rule fires for `entity` at time `now`
    pub fn fires(
        &self,
        entity: &EntityView,
        now: f64,
        active_groups: &BTreeSet<String>,
        tolerance: f64,
    ) -> bool {
        if !self.applies_to(entity) {
            return false;
        }
        match &self.trigger {
            Trigger::Timed { dwell } => entity.lifecycle.time_in_state(now) + tolerance >= *dwell,
            Trigger::Threshold {
                quantity,
                above,
                below,
            } => match entity.value(quantity) {
                Some(v) => above.map_or(true, |a| v > a) && below.map_or(true, |b| v < b),
                None => false,
            },
            Trigger::Signal { group } => active_groups.contains(group),
        }
    }

    /// Seconds until a timed rule fires for `entity`, if it is pending
    pub fn remaining(&self, entity: &EntityView, now: f64) -> Option<f64> {
        match self.trigger {
            Trigger::Timed { dwell } if self.applies_to(entity) => {
                Some((dwell - entity.lifecycle.time_in_state(now)).max(0.0))
            }
            _ => None,
        }
    }
}

/// Propose at most one transition per entity: the first matching rule in
/// declaration order wins.
pub fn plan_transitions(
    rules: &[LifecycleRule],
    types: &BTreeMap<String, EntityType>,
    snapshot: &RegistrySnapshot,
    now: f64,
    active_groups: &BTreeSet<String>,
    tolerance: f64,
) -> TickPlan {
    let mut plan = TickPlan::default();
    if rules.is_empty() {
        return plan;
    }

    for entity in snapshot.iter() {
        let Some(rule) = rules
            .iter()
            .find(|r| r.fires(entity, now, active_groups, tolerance))
        else {
            continue;
        };

        let mut mutations = vec![Mutation::Transition {
            entity: entity.id,
            to: rule.to,
        }];
        for effect in &rule.effects {
            match effect {
                Effect::Spawn { entity_type } => match types.get(entity_type) {
                    Some(template) => mutations.push(Mutation::Spawn(template.instantiate())),
                    None => plan.events.push(
                        TickEvent::new(
                            EventKind::UnknownEntity,
                            format!("{}: no template for type '{}'", rule.name, entity_type),
                        )
                        .with_source(&rule.name)
                        .with_entity(entity.id),
                    ),
                },
                Effect::RemoveSubject => mutations.push(Mutation::Remove { entity: entity.id }),
            }
        }

        plan.contributions.push(Contribution {
            origin: Origin::Lifecycle {
                rule: rule.name.clone(),
                entity: entity.id,
            },
            mutations,
        });
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{EntityKind, EntitySpec, Quantities, Quantity};
    use crate::registry::EntityRegistry;

    fn osteoblast_type() -> EntityType {
        EntityType {
            name: "osteoblast".into(),
            kind: EntityKind::Cell,
            initial_state: LifecycleState::Progenitor,
            quantities: Quantities::new().with("matrix", Quantity::mass(0.0)),
        }
    }

    fn types() -> BTreeMap<String, EntityType> {
        let mut types = BTreeMap::new();
        types.insert("osteoblast".to_string(), osteoblast_type());
        types
    }

    fn site_registry(entered_at: f64) -> (EntityRegistry, RegistrySnapshot) {
        let mut registry = EntityRegistry::new();
        let mut spec = EntitySpec::new("remodelingSite", EntityKind::TissueSite)
            .with_state(LifecycleState::Reversal)
            .with_quantity("mineral", Quantity::mass(40.0));
        spec.entered_at = Some(entered_at);
        registry.register(spec, 0.0).unwrap();
        let snapshot = registry.snapshot();
        (registry, snapshot)
    }

    fn reversal_rule() -> LifecycleRule {
        LifecycleRule {
            name: "startFormation".into(),
            entity_type: "remodelingSite".into(),
            from: LifecycleState::Reversal,
            to: LifecycleState::Forming,
            trigger: Trigger::Timed { dwell: 100.0 },
            effects: vec![Effect::Spawn {
                entity_type: "osteoblast".into(),
            }],
        }
    }

    #[test]
    fn test_timed_rule_waits_for_dwell() {
        let (_, snapshot) = site_registry(0.0);
        let groups = BTreeSet::new();

        let early = plan_transitions(&[reversal_rule()], &types(), &snapshot, 50.0, &groups, 1e-9);
        assert!(early.contributions.is_empty());

        let due = plan_transitions(&[reversal_rule()], &types(), &snapshot, 100.0, &groups, 1e-9);
        assert_eq!(due.contributions.len(), 1);
        let muts = &due.contributions[0].mutations;
        assert!(matches!(muts[0], Mutation::Transition { to: LifecycleState::Forming, .. }));
        assert!(matches!(&muts[1], Mutation::Spawn(spec) if spec.type_name == "osteoblast"));
    }

    #[test]
    fn test_remaining_dwell() {
        let (_, snapshot) = site_registry(10.0);
        let site = snapshot.iter().next().unwrap();
        assert_eq!(reversal_rule().remaining(site, 60.0), Some(50.0));
        assert_eq!(reversal_rule().remaining(site, 500.0), Some(0.0));
    }

    #[test]
    fn test_signal_rule_follows_group() {
        let mut registry = EntityRegistry::new();
        registry
            .register(EntitySpec::new("remodelingSite", EntityKind::TissueSite), 0.0)
            .unwrap();
        let snapshot = registry.snapshot();
        let rule = LifecycleRule {
            name: "pthActivation".into(),
            entity_type: "remodelingSite".into(),
            from: LifecycleState::Quiescent,
            to: LifecycleState::Active,
            trigger: Trigger::Signal {
                group: "raiseCalcium".into(),
            },
            effects: Vec::new(),
        };

        let idle = plan_transitions(&[rule.clone()], &types(), &snapshot, 1.0, &BTreeSet::new(), 0.0);
        assert!(idle.contributions.is_empty());

        let groups: BTreeSet<String> = ["raiseCalcium".to_string()].into_iter().collect();
        let active = plan_transitions(&[rule], &types(), &snapshot, 1.0, &groups, 0.0);
        assert_eq!(active.contributions.len(), 1);
    }

    #[test]
    fn test_threshold_rule_with_removal() {
        let mut registry = EntityRegistry::new();
        registry
            .register(
                EntitySpec::new("osteocyte", EntityKind::Cell)
                    .with_state(LifecycleState::Mature)
                    .with_quantity("viability", Quantity::dimensionless(0.1)),
                0.0,
            )
            .unwrap();
        let rule = LifecycleRule {
            name: "apoptosis".into(),
            entity_type: "osteocyte".into(),
            from: LifecycleState::Mature,
            to: LifecycleState::Apoptotic,
            trigger: Trigger::Threshold {
                quantity: "viability".into(),
                above: None,
                below: Some(0.2),
            },
            effects: vec![Effect::RemoveSubject],
        };

        let plan = plan_transitions(
            &[rule],
            &types(),
            &registry.snapshot(),
            1.0,
            &BTreeSet::new(),
            0.0,
        );
        let muts = &plan.contributions[0].mutations;
        assert_eq!(muts.len(), 2);
        assert!(matches!(muts[1], Mutation::Remove { .. }));
    }
}
