//! Save/Load functionality for persisting simulation state
//!
//! `StateSnapshot` captures everything that influences future ticks: the
//! clock, every live entity (as report rows), the id allocator history,
//! controller phases and the last evaluation time of slow processes.
//! Definitions are not saved; a snapshot is resumed against the scenario
//! it came from.
//!
//! Two encodings: JSON for inspection and reuse as a new run's initial
//! state, and bincode for compact save files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::components::EntityId;
use crate::error::{SimError, SimResult};
use crate::report::EntityRecord;
use crate::scheduler::SimulationClock;
use crate::systems::RegulatoryPhase;

/// Version number for save file format (increment when format changes)
pub const SAVE_VERSION: u32 = 1;

/// Complete resumable state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub scenario: String,
    pub clock: SimulationClock,
    /// Next id the registry will allocate
    pub next_id: u64,
    /// Ids of destroyed entities, never handed out again
    pub retired: Vec<EntityId>,
    pub entities: Vec<EntityRecord>,
    pub phases: BTreeMap<String, RegulatoryPhase>,
    /// Last evaluation time (s) of each periodic process
    pub last_eval: BTreeMap<String, f64>,
}

impl StateSnapshot {
    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> SimResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Write a snapshot as a version header followed by the bincode body
pub fn save_simulation<W: Write>(mut writer: W, state: &StateSnapshot) -> SimResult<()> {
    bincode::serialize_into(&mut writer, &SAVE_VERSION)?;
    bincode::serialize_into(&mut writer, state)?;
    writer.flush()?;
    Ok(())
}

/// Read a snapshot written by `save_simulation`
pub fn load_simulation<R: Read>(mut reader: R) -> SimResult<StateSnapshot> {
    let version: u32 = bincode::deserialize_from(&mut reader)?;
    if version != SAVE_VERSION {
        return Err(SimError::VersionMismatch {
            expected: SAVE_VERSION,
            found: version,
        });
    }
    Ok(bincode::deserialize_from(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{EntityKind, LifecycleState, Quantity};

    fn sample() -> StateSnapshot {
        let mut quantities = BTreeMap::new();
        quantities.insert("mineral".to_string(), Quantity::mass(40.0));
        let mut phases = BTreeMap::new();
        phases.insert("calciumHomeostasis".to_string(), RegulatoryPhase::CorrectingUp);
        let mut last_eval = BTreeMap::new();
        last_eval.insert("mineralization".to_string(), 3600.0);

        StateSnapshot {
            scenario: "bone remodeling".into(),
            clock: SimulationClock::at(12, 43200.0),
            next_id: 9,
            retired: vec![EntityId(3), EntityId(5)],
            entities: vec![EntityRecord {
                tick: 12,
                time: 43200.0,
                id: EntityId(4),
                entity_type: "remodelingSite".into(),
                kind: EntityKind::TissueSite,
                state: LifecycleState::Forming,
                entered_at: 36000.0,
                quantities,
                conserved: vec!["mineral".into()],
            }],
            phases,
            last_eval,
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let state = sample();
        let mut buffer = Vec::new();
        save_simulation(&mut buffer, &state).unwrap();

        let loaded = load_simulation(buffer.as_slice()).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_version_mismatch() {
        let mut buffer = Vec::new();
        bincode::serialize_into(&mut buffer, &(SAVE_VERSION + 1)).unwrap();
        bincode::serialize_into(&mut buffer, &sample()).unwrap();

        match load_simulation(buffer.as_slice()) {
            Err(SimError::VersionMismatch { expected, found }) => {
                assert_eq!(expected, SAVE_VERSION);
                assert_eq!(found, SAVE_VERSION + 1);
            }
            other => panic!("expected version mismatch, got {:?}", other.map(|s| s.scenario)),
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let state = sample();
        let json = state.to_json().unwrap();
        assert!(json.contains("\"correctingUp\""));
        assert_eq!(StateSnapshot::from_json(&json).unwrap(), state);
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let mut buffer = Vec::new();
        save_simulation(&mut buffer, &sample()).unwrap();
        buffer.truncate(buffer.len() / 2);
        assert!(matches!(
            load_simulation(buffer.as_slice()),
            Err(SimError::Serialization(_))
        ));
    }
}
