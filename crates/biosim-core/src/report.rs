//! Per-tick reporting: one record per entity per tick plus every event
//! recovered during the tick, streamed into a `ReportSink`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};

use crate::components::{EntityId, EntityKind, EntityView, LifecycleState, Quantities, Quantity};
use crate::error::SimResult;
use crate::systems::RegulatoryPhase;

/// Category of a tick event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A proposed mutation was rejected and its origin dropped
    InvariantViolation,
    /// A rate law produced NaN or infinity
    NumericError,
    /// A reference pointed at an entity or quantity that is not there
    UnknownEntity,
    /// Competing demand was scaled down
    Contention,
    PhaseChange,
    Transition,
    Spawned,
    Removed,
}

impl EventKind {
    /// Recovered run-time errors, as opposed to informational events
    pub fn is_error(self) -> bool {
        matches!(
            self,
            EventKind::InvariantViolation | EventKind::NumericError | EventKind::UnknownEntity
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickEvent {
    pub kind: EventKind,
    /// Process, rule or regulator that raised the event
    pub source: Option<String>,
    pub entity: Option<EntityId>,
    pub message: String,
}

impl TickEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            source: None,
            entity: None,
            message: message.into(),
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_entity(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }
}

/// One row per entity per tick. Also the format a snapshot reloads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub tick: u64,
    pub time: f64,
    pub id: EntityId,
    pub entity_type: String,
    pub kind: EntityKind,
    pub state: LifecycleState,
    pub entered_at: f64,
    pub quantities: BTreeMap<String, Quantity>,
    pub conserved: Vec<String>,
}

impl EntityRecord {
    pub fn from_view(view: &EntityView, tick: u64, time: f64) -> Self {
        Self {
            tick,
            time,
            id: view.id,
            entity_type: view.type_name.clone(),
            kind: view.kind,
            state: view.lifecycle.state,
            entered_at: view.lifecycle.entered_at,
            quantities: view.quantities.iter().map(|(k, q)| (k.to_string(), q)).collect(),
            conserved: view.quantities.conserved_names().map(str::to_string).collect(),
        }
    }

    pub fn value(&self, quantity: &str) -> Option<f64> {
        self.quantities.get(quantity).map(|q| q.value)
    }

    /// Rebuild the quantity table, keeping the recorded conserved set
    pub fn to_quantities(&self) -> Quantities {
        let mut quantities = Quantities::new();
        for (name, q) in &self.quantities {
            quantities.insert(name.clone(), *q);
        }
        for name in &self.conserved {
            quantities.mark_conserved(name);
        }
        quantities
    }
}

/// Everything observable about one committed tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    /// Simulation time (s) after the tick
    pub time: f64,
    pub dt: f64,
    pub records: Vec<EntityRecord>,
    pub events: Vec<TickEvent>,
    pub phases: BTreeMap<String, RegulatoryPhase>,
    pub active_groups: BTreeSet<String>,
}

impl TickReport {
    pub fn record(&self, id: EntityId) -> Option<&EntityRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn records_of_type<'a>(&'a self, entity_type: &'a str) -> impl Iterator<Item = &'a EntityRecord> + 'a {
        self.records.iter().filter(move |r| r.entity_type == entity_type)
    }

    pub fn errors(&self) -> impl Iterator<Item = &TickEvent> {
        self.events.iter().filter(|e| e.kind.is_error())
    }

    /// True when at least one mutation or process was dropped this tick
    pub fn partially_failed(&self) -> bool {
        self.errors().next().is_some()
    }
}

/// Consumer of the per-tick report stream
pub trait ReportSink {
    fn record(&mut self, report: &TickReport) -> SimResult<()>;
}

/// Keeps every report in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub reports: Vec<TickReport>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&TickReport> {
        self.reports.last()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &TickEvent> {
        self.reports.iter().flat_map(|r| r.events.iter())
    }
}

impl ReportSink for MemorySink {
    fn record(&mut self, report: &TickReport) -> SimResult<()> {
        self.reports.push(report.clone());
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn record(&mut self, _report: &TickReport) -> SimResult<()> {
        Ok(())
    }
}

/// Writes one JSON document per tick, one per line
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ReportSink for JsonLinesSink<W> {
    /// Each line is flushed so a reader tailing the stream sees whole ticks
    fn record(&mut self, report: &TickReport) -> SimResult<()> {
        serde_json::to_writer(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Read back a stream written by `JsonLinesSink`
pub fn read_json_lines<R: BufRead>(reader: R) -> SimResult<Vec<TickReport>> {
    let mut reports = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        reports.push(serde_json::from_str(&line)?);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{EntityKind, EntitySpec};
    use crate::registry::EntityRegistry;
    use std::io::BufWriter;

    fn sample_report() -> TickReport {
        let mut registry = EntityRegistry::new();
        registry
            .register(
                EntitySpec::new("bloodCalcium", EntityKind::Molecule)
                    .with_quantity("calcium", Quantity::concentration(2.15)),
                0.0,
            )
            .unwrap();
        let snapshot = registry.snapshot();
        TickReport {
            tick: 1,
            time: 1.0,
            dt: 1.0,
            records: snapshot
                .iter()
                .map(|v| EntityRecord::from_view(v, 1, 1.0))
                .collect(),
            events: vec![TickEvent::new(EventKind::NumericError, "hill overflow")
                .with_source("pthRelease")],
            phases: BTreeMap::new(),
            active_groups: BTreeSet::new(),
        }
    }

    #[test]
    fn test_record_keeps_conserved_set() {
        let report = sample_report();
        let record = &report.records[0];
        assert_eq!(record.conserved, vec!["calcium".to_string()]);
        let quantities = record.to_quantities();
        assert!(quantities.is_conserved("calcium"));
        assert_eq!(quantities.value("calcium"), Some(2.15));
    }

    #[test]
    fn test_partial_failure_flag() {
        let mut report = sample_report();
        assert!(report.partially_failed());
        report.events[0].kind = EventKind::Contention;
        assert!(!report.partially_failed());
    }

    #[test]
    fn test_json_lines_sink_writes_one_line_per_tick() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let report = sample_report();
        sink.record(&report).unwrap();
        sink.record(&report).unwrap();

        let bytes = sink.into_inner();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert_eq!(text.lines().count(), 2);

        let back = read_json_lines(bytes.as_slice()).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].records[0].value("calcium"), Some(2.15));
        assert_eq!(back[1].events[0].source.as_deref(), Some("pthRelease"));
    }

    #[test]
    fn test_json_lines_sink_flushes_buffered_writer() {
        let mut sink = JsonLinesSink::new(BufWriter::new(Vec::new()));
        sink.record(&sample_report()).unwrap();

        let written = sink.get_ref().get_ref();
        assert!(written.ends_with(b"\n"));
        let back = read_json_lines(written.as_slice()).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].tick, 1);
    }

    #[test]
    fn test_memory_sink() {
        let mut sink = MemorySink::new();
        sink.record(&sample_report()).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.events().count(), 1);
    }
}
