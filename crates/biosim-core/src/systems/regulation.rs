//! Regulatory feedback controller.
//!
//! Each loop watches an aggregate of one quantity over every live entity
//! of a type and, while the aggregate sits outside `set_point ± deadband`,
//! keeps a corrective process group active. The next phase depends only
//! on the previous phase and the snapshot, and is computed once per tick
//! before any process runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::registry::RegistrySnapshot;
use crate::report::{EventKind, TickEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegulatoryPhase {
    #[default]
    WithinRange,
    /// First tick below the deadband floor
    DeviatingLow,
    /// Still below the floor with the low-side group active
    CorrectingUp,
    DeviatingHigh,
    CorrectingDown,
}

impl RegulatoryPhase {
    pub fn name(self) -> &'static str {
        match self {
            RegulatoryPhase::WithinRange => "withinRange",
            RegulatoryPhase::DeviatingLow => "deviatingLow",
            RegulatoryPhase::CorrectingUp => "correctingUp",
            RegulatoryPhase::DeviatingHigh => "deviatingHigh",
            RegulatoryPhase::CorrectingDown => "correctingDown",
        }
    }

    pub fn is_low(self) -> bool {
        matches!(self, RegulatoryPhase::DeviatingLow | RegulatoryPhase::CorrectingUp)
    }

    pub fn is_high(self) -> bool {
        matches!(self, RegulatoryPhase::DeviatingHigh | RegulatoryPhase::CorrectingDown)
    }
}

impl fmt::Display for RegulatoryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the monitored quantity is folded over entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aggregate {
    Sum,
    #[default]
    Mean,
    Min,
    Max,
}

impl Aggregate {
    pub fn fold(self, values: impl Iterator<Item = f64>) -> Option<f64> {
        let mut count = 0usize;
        let mut acc: Option<f64> = None;
        for v in values {
            count += 1;
            acc = Some(match (self, acc) {
                (_, None) => v,
                (Aggregate::Sum | Aggregate::Mean, Some(a)) => a + v,
                (Aggregate::Min, Some(a)) => a.min(v),
                (Aggregate::Max, Some(a)) => a.max(v),
            });
        }
        match self {
            Aggregate::Mean => acc.map(|sum| sum / count as f64),
            _ => acc,
        }
    }
}

/// Immutable loop definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulatoryLoop {
    pub name: String,
    pub entity_type: String,
    pub quantity: String,
    #[serde(default)]
    pub aggregate: Aggregate,
    pub set_point: f64,
    pub deadband: f64,
    /// Group activated while the value is below the band
    #[serde(default)]
    pub low_group: Option<String>,
    /// Group activated while the value is above the band
    #[serde(default)]
    pub high_group: Option<String>,
}

impl RegulatoryLoop {
    pub fn floor(&self) -> f64 {
        self.set_point - self.deadband
    }

    pub fn ceiling(&self) -> f64 {
        self.set_point + self.deadband
    }

    /// Aggregate of the monitored quantity, `None` when nothing carries it
    pub fn observe(&self, snapshot: &RegistrySnapshot) -> Option<f64> {
        self.aggregate.fold(
            snapshot
                .of_type(&self.entity_type)
                .filter_map(|e| e.value(&self.quantity)),
        )
    }

    pub fn next_phase(&self, previous: RegulatoryPhase, value: f64, tolerance: f64) -> RegulatoryPhase {
        use RegulatoryPhase::*;
        if value < self.floor() - tolerance {
            if previous.is_low() {
                CorrectingUp
            } else {
                DeviatingLow
            }
        } else if value > self.ceiling() + tolerance {
            if previous.is_high() {
                CorrectingDown
            } else {
                DeviatingHigh
            }
        } else {
            WithinRange
        }
    }

    /// Corrective group held active in `phase`
    pub fn active_group(&self, phase: RegulatoryPhase) -> Option<&str> {
        if phase.is_low() {
            self.low_group.as_deref()
        } else if phase.is_high() {
            self.high_group.as_deref()
        } else {
            None
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.low_group.iter().chain(self.high_group.iter()).map(String::as_str)
    }
}

/// Controller decisions for one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegulationOutcome {
    pub phases: BTreeMap<String, RegulatoryPhase>,
    pub active_groups: BTreeSet<String>,
    pub values: BTreeMap<String, f64>,
    pub events: Vec<TickEvent>,
}

/// Advance every loop one step from the snapshot
pub fn regulate(
    loops: &[RegulatoryLoop],
    previous: &BTreeMap<String, RegulatoryPhase>,
    snapshot: &RegistrySnapshot,
    tolerance: f64,
) -> RegulationOutcome {
    let mut outcome = RegulationOutcome::default();

    for lp in loops {
        let before = previous.get(&lp.name).copied().unwrap_or_default();
        let after = match lp.observe(snapshot) {
            Some(value) if value.is_finite() => {
                outcome.values.insert(lp.name.clone(), value);
                lp.next_phase(before, value, tolerance)
            }
            observed => {
                // Nothing to regulate: release the groups until the quantity returns
                let reason = match observed {
                    Some(v) => format!("{}: monitored value {} is not finite", lp.name, v),
                    None => format!(
                        "{}: no live '{}' carries '{}'",
                        lp.name, lp.entity_type, lp.quantity
                    ),
                };
                let kind = if observed.is_some() {
                    EventKind::NumericError
                } else {
                    EventKind::UnknownEntity
                };
                outcome
                    .events
                    .push(TickEvent::new(kind, reason).with_source(&lp.name));
                RegulatoryPhase::WithinRange
            }
        };

        if after != before {
            let message = match outcome.values.get(&lp.name) {
                Some(v) => format!("{}: {} -> {} at {:.4}", lp.name, before, after, v),
                None => format!("{}: {} -> {}", lp.name, before, after),
            };
            log::info!("{}", message);
            outcome
                .events
                .push(TickEvent::new(EventKind::PhaseChange, message).with_source(&lp.name));
        }
        if let Some(group) = lp.active_group(after) {
            outcome.active_groups.insert(group.to_string());
        }
        outcome.phases.insert(lp.name.clone(), after);
    }
    outcome
}
