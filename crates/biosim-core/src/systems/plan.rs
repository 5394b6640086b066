//! Per-tick plan: what every rule wants to change, grouped by origin so a
//! rejected mutation can be traced back to the rules that proposed it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::components::{EntityId, Quantity, Unit};
use crate::registry::Mutation;
use crate::report::TickEvent;

/// The rule instance behind a contribution
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
    Process { name: String, subject: EntityId },
    Lifecycle { rule: String, entity: EntityId },
}

impl Origin {
    pub fn source(&self) -> &str {
        match self {
            Origin::Process { name, .. } => name,
            Origin::Lifecycle { rule, .. } => rule,
        }
    }

    pub fn entity(&self) -> EntityId {
        match self {
            Origin::Process { subject, .. } => *subject,
            Origin::Lifecycle { entity, .. } => *entity,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Process { name, subject } => write!(f, "process {} on {}", name, subject),
            Origin::Lifecycle { rule, entity } => write!(f, "lifecycle rule {} on {}", rule, entity),
        }
    }
}

/// Mutations proposed by one rule instance
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub origin: Origin,
    pub mutations: Vec<Mutation>,
}

/// Everything computed for one tick before anything is committed
#[derive(Debug, Clone, Default)]
pub struct TickPlan {
    pub contributions: Vec<Contribution>,
    pub events: Vec<TickEvent>,
}

impl TickPlan {
    pub fn extend(&mut self, other: TickPlan) {
        self.contributions.extend(other.contributions);
        self.events.extend(other.events);
    }

    /// Merge the non-excluded contributions into a single transaction.
    ///
    /// Quantity adjustments are summed per (entity, quantity, unit) so
    /// competing processes carry no ordering bias. A delta in a foreign unit
    /// stays separate and is rejected on its own. Adjustments come first,
    /// followed by
    /// sets, transitions, spawns and removals. Alongside each mutation the
    /// indices of the contributions that produced it are returned.
    pub fn batch(&self, excluded: &BTreeSet<usize>) -> (Vec<Mutation>, Vec<Vec<usize>>) {
        let mut adjusts: BTreeMap<(EntityId, String, Unit), (f64, Vec<usize>)> =
            BTreeMap::new();
        let mut rest: Vec<(u8, usize, Mutation)> = Vec::new();

        for (ci, contribution) in self.contributions.iter().enumerate() {
            if excluded.contains(&ci) {
                continue;
            }
            for mutation in &contribution.mutations {
                match mutation {
                    Mutation::Adjust {
                        entity,
                        quantity,
                        delta,
                    } => {
                        let slot = adjusts
                            .entry((*entity, quantity.clone(), delta.unit))
                            .or_insert((0.0, Vec::new()));
                        slot.0 += delta.value;
                        if !slot.1.contains(&ci) {
                            slot.1.push(ci);
                        }
                    }
                    other => rest.push((rank(other), ci, other.clone())),
                }
            }
        }
        rest.sort_by_key(|(r, ci, _)| (*r, *ci));

        let mut mutations = Vec::with_capacity(adjusts.len() + rest.len());
        let mut origins = Vec::with_capacity(adjusts.len() + rest.len());
        for ((entity, quantity, unit), (delta, sources)) in adjusts {
            mutations.push(Mutation::Adjust {
                entity,
                quantity,
                delta: Quantity::new(delta, unit),
            });
            origins.push(sources);
        }
        for (_, ci, mutation) in rest {
            mutations.push(mutation);
            origins.push(vec![ci]);
        }
        (mutations, origins)
    }
}

fn rank(mutation: &Mutation) -> u8 {
    match mutation {
        Mutation::Adjust { .. } => 0,
        Mutation::Set { .. } => 1,
        Mutation::Transition { .. } => 2,
        Mutation::Spawn(_) => 3,
        Mutation::Remove { .. } => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::LifecycleState;

    fn adjust(entity: u64, delta: f64) -> Mutation {
        Mutation::Adjust {
            entity: EntityId(entity),
            quantity: "calcium".into(),
            delta: Quantity::concentration(delta),
        }
    }

    fn process(name: &str, subject: u64) -> Origin {
        Origin::Process {
            name: name.into(),
            subject: EntityId(subject),
        }
    }

    #[test]
    fn test_adjusts_are_summed_per_pool() {
        let plan = TickPlan {
            contributions: vec![
                Contribution {
                    origin: process("absorb", 1),
                    mutations: vec![adjust(1, 0.5)],
                },
                Contribution {
                    origin: process("excrete", 1),
                    mutations: vec![adjust(1, -0.2)],
                },
            ],
            events: Vec::new(),
        };

        let (batch, origins) = plan.batch(&BTreeSet::new());
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            Mutation::Adjust { delta, .. } => {
                assert!((delta.value - 0.3).abs() < 1e-12);
                assert_eq!(delta.unit, Unit::Concentration);
            }
            other => panic!("unexpected mutation {other}"),
        }
        assert_eq!(origins[0], vec![0, 1]);
    }

    #[test]
    fn test_foreign_unit_adjust_is_not_merged() {
        let plan = TickPlan {
            contributions: vec![
                Contribution {
                    origin: process("absorb", 1),
                    mutations: vec![adjust(1, 0.5)],
                },
                Contribution {
                    origin: process("resorb", 2),
                    mutations: vec![Mutation::Adjust {
                        entity: EntityId(1),
                        quantity: "calcium".into(),
                        delta: Quantity::mass(0.2),
                    }],
                },
            ],
            events: Vec::new(),
        };

        let (batch, origins) = plan.batch(&BTreeSet::new());
        assert_eq!(batch.len(), 2);
        assert_eq!(origins, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_excluded_contributions_are_dropped() {
        let plan = TickPlan {
            contributions: vec![
                Contribution {
                    origin: process("absorb", 1),
                    mutations: vec![adjust(1, 0.5)],
                },
                Contribution {
                    origin: Origin::Lifecycle {
                        rule: "activate".into(),
                        entity: EntityId(2),
                    },
                    mutations: vec![Mutation::Transition {
                        entity: EntityId(2),
                        to: LifecycleState::Active,
                    }],
                },
            ],
            events: Vec::new(),
        };

        let excluded: BTreeSet<usize> = [0].into_iter().collect();
        let (batch, origins) = plan.batch(&excluded);
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0], Mutation::Transition { .. }));
        assert_eq!(origins, vec![vec![1]]);
    }

    #[test]
    fn test_removals_follow_adjustments() {
        let plan = TickPlan {
            contributions: vec![Contribution {
                origin: Origin::Lifecycle {
                    rule: "apoptosis".into(),
                    entity: EntityId(3),
                },
                mutations: vec![Mutation::Remove { entity: EntityId(3) }, adjust(3, 1.0)],
            }],
            events: Vec::new(),
        };
        let (batch, _) = plan.batch(&BTreeSet::new());
        assert!(matches!(batch[0], Mutation::Adjust { .. }));
        assert!(matches!(batch[1], Mutation::Remove { .. }));
    }
}
