//! Simulation engine - main entry point for running the simulation
//!
//! One tick:
//! 1. snapshot the registry (the only state any rule reads this tick)
//! 2. regulators pick their phases and the active corrective groups
//! 3. due processes and lifecycle rules propose mutations
//! 4. everything is committed as one transaction; an origin whose
//!    mutation is rejected is dropped and the rest is retried
//! 5. the clock advances and a report is emitted

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::components::{EntityId, EntitySpec};
use crate::config::{Definitions, ScenarioConfig};
use crate::error::{SimError, SimResult};
use crate::persistence::{self, StateSnapshot};
use crate::registry::{EntityRegistry, RegistrySnapshot, TransactionReceipt};
use crate::relations::RelationGraph;
use crate::report::{EntityRecord, EventKind, ReportSink, TickEvent, TickReport};
use crate::scheduler::{
    CancelHandle, RateTracker, RunSummary, Scheduler, SimulationClock, StopReason, TickMode,
};
use crate::systems::*;

/// Main simulation engine
pub struct SimulationEngine {
    /// Immutable scenario, shared read-only
    defs: Arc<Definitions>,
    registry: EntityRegistry,
    scheduler: Scheduler,
    /// Throttling state for slow processes
    rates: RateTracker,
    /// Controller phase per regulatory loop, from the last tick
    phases: BTreeMap<String, RegulatoryPhase>,
    active_groups: BTreeSet<String>,
}

#[derive(Clone, Copy)]
enum Limit {
    Ticks(u64),
    Until(f64),
}

impl SimulationEngine {
    /// Create a simulation at t = 0 with the scenario's initial entities
    pub fn new(defs: Arc<Definitions>) -> SimResult<Self> {
        let mut registry = EntityRegistry::new();
        for spec in &defs.initial {
            registry.register(spec.clone(), 0.0).map_err(|e| {
                SimError::config(format!("initial entity '{}': {}", spec.type_name, e))
            })?;
        }

        let phases = defs
            .regulators
            .iter()
            .map(|r| (r.name.clone(), RegulatoryPhase::WithinRange))
            .collect();

        log::info!(
            "Simulation '{}' ready with {} entities",
            defs.name,
            registry.len()
        );

        Ok(Self {
            rates: RateTracker::new(&defs.processes, 0.0),
            scheduler: Scheduler::new(defs.settings.tick),
            registry,
            phases,
            active_groups: BTreeSet::new(),
            defs,
        })
    }

    pub fn from_config(config: ScenarioConfig) -> SimResult<Self> {
        Self::new(Arc::new(Definitions::from_config(config)?))
    }

    pub fn from_toml_str(text: &str) -> SimResult<Self> {
        Self::from_config(ScenarioConfig::from_toml_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> SimResult<Self> {
        Self::from_config(ScenarioConfig::from_path(path)?)
    }

    /// Resume a run from a snapshot taken under the same definitions
    pub fn from_snapshot(defs: Arc<Definitions>, state: &StateSnapshot) -> SimResult<Self> {
        let mut engine = Self::new(defs)?;
        engine.restore(state)?;
        Ok(engine)
    }

    /// Replace the whole mutable state with `state`
    pub fn restore(&mut self, state: &StateSnapshot) -> SimResult<()> {
        if state.scenario != self.defs.name {
            log::warn!(
                "Restoring state from scenario '{}' into '{}'",
                state.scenario,
                self.defs.name
            );
        }

        let mut registry =
            EntityRegistry::with_history(state.next_id, state.retired.iter().copied());
        for record in &state.entities {
            let spec = EntitySpec {
                id: Some(record.id),
                type_name: record.entity_type.clone(),
                kind: record.kind,
                state: record.state,
                entered_at: Some(record.entered_at),
                quantities: record.to_quantities(),
            };
            registry.register(spec, state.clock.time)?;
        }

        let mut phases: BTreeMap<String, RegulatoryPhase> = self
            .defs
            .regulators
            .iter()
            .map(|r| (r.name.clone(), RegulatoryPhase::WithinRange))
            .collect();
        phases.extend(state.phases.iter().map(|(k, v)| (k.clone(), *v)));

        let mut last_eval = RateTracker::new(&self.defs.processes, state.clock.time)
            .times()
            .clone();
        last_eval.extend(state.last_eval.iter().map(|(k, v)| (k.clone(), *v)));

        self.registry = registry;
        self.scheduler.set_clock(state.clock);
        self.rates = RateTracker::from_times(last_eval);
        self.active_groups = self
            .defs
            .regulators
            .iter()
            .filter_map(|r| phases.get(&r.name).and_then(|p| r.active_group(*p)))
            .map(str::to_string)
            .collect();
        self.phases = phases;

        log::info!(
            "Restored {} entities at tick {} (t={})",
            self.registry.len(),
            state.clock.tick,
            state.clock.time
        );
        Ok(())
    }

    /// Register an entity between ticks
    pub fn register(&mut self, spec: EntitySpec) -> SimResult<EntityId> {
        let id = self.registry.register(spec, self.time())?;
        log::debug!("Registered entity {}", id);
        Ok(id)
    }

    /// Remove an entity between ticks
    pub fn remove(&mut self, id: EntityId) -> SimResult<()> {
        self.registry.remove(id)
    }

    /// Advance one tick, choosing the step from the tick mode
    pub fn step(&mut self) -> SimResult<TickReport> {
        let snapshot = self.registry.snapshot();
        let dt = self.scheduler.next_dt(self.pending_event(&snapshot));
        self.tick(snapshot, dt)
    }

    /// Seconds until the next scheduled event, for variable stepping
    fn pending_event(&self, snapshot: &RegistrySnapshot) -> Option<f64> {
        if !matches!(self.scheduler.mode(), TickMode::Variable { .. }) {
            return None;
        }
        let now = self.time();
        let dwell = snapshot.iter().flat_map(|entity| {
            self.defs
                .lifecycle_rules
                .iter()
                .filter_map(move |rule| rule.remaining(entity, now))
        });
        let periodic = self
            .defs
            .processes
            .iter()
            .filter_map(|p| self.rates.until_due(p, now));
        dwell.chain(periodic).reduce(f64::min)
    }

    fn tick(&mut self, snapshot: RegistrySnapshot, dt: f64) -> SimResult<TickReport> {
        let defs = Arc::clone(&self.defs);
        let settings = &defs.settings;
        let tol = settings.tolerance;
        let end = self.time() + dt;

        // Controller decisions, once per tick
        let regulation = regulate(&defs.regulators, &self.phases, &snapshot, tol);

        let process_dt: Vec<Option<f64>> = defs
            .processes
            .iter()
            .map(|p| self.rates.due(p, end, dt, tol))
            .collect();

        let mut plan = plan_processes(
            &defs.processes,
            &snapshot,
            &ProcessContext {
                active_groups: &regulation.active_groups,
                process_dt: &process_dt,
                policy: settings.contention,
                parallel: settings.parallel,
            },
        );
        plan.extend(plan_transitions(
            &defs.lifecycle_rules,
            &defs.types,
            &snapshot,
            end,
            &regulation.active_groups,
            tol,
        ));

        let mut events = regulation.events;
        events.append(&mut plan.events);
        let receipt = self.commit(&plan, end, &mut events)?;

        for (process, due) in defs.processes.iter().zip(&process_dt) {
            if due.is_some() {
                self.rates.mark(process, end);
            }
        }
        self.phases = regulation.phases;
        self.active_groups = regulation.active_groups;
        let clock = self.scheduler.advance(dt);

        events.extend(receipt_events(&receipt));

        Ok(TickReport {
            tick: clock.tick,
            time: clock.time,
            dt,
            records: self.records_at(clock),
            events,
            phases: self.phases.clone(),
            active_groups: self.active_groups.clone(),
        })
    }

    /// Commit the plan, dropping every origin behind a rejected mutation
    /// until the remainder applies cleanly. Each retry excludes at least
    /// one more contribution, so this ends with at worst an empty batch.
    fn commit(
        &mut self,
        plan: &TickPlan,
        now: f64,
        events: &mut Vec<TickEvent>,
    ) -> SimResult<TransactionReceipt> {
        let mut excluded = BTreeSet::new();
        loop {
            let (batch, origins) = plan.batch(&excluded);
            match self.registry.apply_transaction(&batch, now) {
                Ok(receipt) => return Ok(receipt),
                Err(SimError::InvariantViolation {
                    index,
                    mutation,
                    reason,
                }) => {
                    let offenders = origins.get(index).cloned().unwrap_or_default();
                    if offenders.is_empty() {
                        return Err(SimError::InvariantViolation {
                            index,
                            mutation,
                            reason,
                        });
                    }
                    for ci in offenders {
                        let origin = &plan.contributions[ci].origin;
                        log::warn!("Rejected {} ({}); dropped {}", mutation, reason, origin);
                        events.push(
                            TickEvent::new(
                                EventKind::InvariantViolation,
                                format!("{} rejected: {}; dropped {}", mutation, reason, origin),
                            )
                            .with_source(origin.source())
                            .with_entity(origin.entity()),
                        );
                        excluded.insert(ci);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a fixed number of ticks
    pub fn run_ticks(&mut self, ticks: u64, sink: &mut dyn ReportSink) -> SimResult<RunSummary> {
        self.run(Limit::Ticks(ticks), None, sink)
    }

    /// Run until simulated time reaches `time`; the last step is shortened
    /// to land on it exactly.
    pub fn run_until(&mut self, time: f64, sink: &mut dyn ReportSink) -> SimResult<RunSummary> {
        self.run(Limit::Until(time), None, sink)
    }

    /// Simulate `duration` seconds, giving up once `wall_timeout` of real
    /// time has passed (checked between ticks).
    pub fn run_for(
        &mut self,
        duration: f64,
        wall_timeout: Option<Duration>,
        sink: &mut dyn ReportSink,
    ) -> SimResult<RunSummary> {
        let deadline = wall_timeout.map(|t| Instant::now() + t);
        self.run(Limit::Until(self.time() + duration), deadline, sink)
    }

    fn run(
        &mut self,
        limit: Limit,
        deadline: Option<Instant>,
        sink: &mut dyn ReportSink,
    ) -> SimResult<RunSummary> {
        let start = self.clock();
        let tol = self.defs.settings.tolerance;
        let mut errors = 0;

        let reason = loop {
            let remaining = match limit {
                Limit::Ticks(n) if self.tick_count() - start.tick >= n => break StopReason::Completed,
                Limit::Until(t) if self.time() >= t - tol => break StopReason::Completed,
                Limit::Ticks(_) => None,
                Limit::Until(t) => Some(t - self.time()),
            };
            if let Some(reason) = self.scheduler.interruption(deadline) {
                break reason;
            }

            let snapshot = self.registry.snapshot();
            let mut dt = self.scheduler.next_dt(self.pending_event(&snapshot));
            if let Some(remaining) = remaining {
                dt = dt.min(remaining);
            }
            let report = self.tick(snapshot, dt)?;
            errors += report.errors().count();
            sink.record(&report)?;
        };

        let end = self.clock();
        log::info!(
            "Run {:?}: {} ticks, t={} -> t={}, {} recovered errors",
            reason,
            end.tick - start.tick,
            start.time,
            end.time,
            errors
        );
        Ok(RunSummary {
            ticks: end.tick - start.tick,
            start_time: start.time,
            end_time: end.time,
            reason,
            errors,
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.scheduler.cancel_handle()
    }

    pub fn definitions(&self) -> &Arc<Definitions> {
        &self.defs
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn relations(&self) -> &RelationGraph {
        &self.defs.relations
    }

    /// Immutable copy of every live entity
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    pub fn clock(&self) -> SimulationClock {
        self.scheduler.clock()
    }

    /// Current simulation time in seconds
    pub fn time(&self) -> f64 {
        self.scheduler.clock().time
    }

    pub fn tick_count(&self) -> u64 {
        self.scheduler.clock().tick
    }

    pub fn phase(&self, regulator: &str) -> Option<RegulatoryPhase> {
        self.phases.get(regulator).copied()
    }

    pub fn phases(&self) -> &BTreeMap<String, RegulatoryPhase> {
        &self.phases
    }

    /// Groups activated on the last tick
    pub fn active_groups(&self) -> &BTreeSet<String> {
        &self.active_groups
    }

    /// Current state as report rows
    pub fn records(&self) -> Vec<EntityRecord> {
        self.records_at(self.clock())
    }

    fn records_at(&self, clock: SimulationClock) -> Vec<EntityRecord> {
        self.registry
            .snapshot()
            .iter()
            .map(|view| EntityRecord::from_view(view, clock.tick, clock.time))
            .collect()
    }

    pub fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            scenario: self.defs.name.clone(),
            clock: self.clock(),
            next_id: self.registry.next_id(),
            retired: self.registry.retired().collect(),
            entities: self.records(),
            phases: self.phases.clone(),
            last_eval: self.rates.times().clone(),
        }
    }

    /// Save simulation state to a writer
    pub fn save<W: Write>(&self, writer: W) -> SimResult<()> {
        persistence::save_simulation(writer, &self.state_snapshot())
    }

    /// Load simulation state from a reader
    pub fn load<R: Read>(&mut self, reader: R) -> SimResult<()> {
        let state = persistence::load_simulation(reader)?;
        self.restore(&state)
    }
}

fn receipt_events(receipt: &TransactionReceipt) -> Vec<TickEvent> {
    let mut events = Vec::new();
    for (id, from, to) in &receipt.transitions {
        log::debug!("Entity {} {} -> {}", id, from, to);
        events.push(
            TickEvent::new(EventKind::Transition, format!("{} -> {}", from, to)).with_entity(*id),
        );
    }
    for id in &receipt.spawned {
        log::debug!("Spawned entity {}", id);
        events.push(TickEvent::new(EventKind::Spawned, format!("spawned {}", id)).with_entity(*id));
    }
    for id in &receipt.removed {
        log::debug!("Removed entity {}", id);
        events.push(TickEvent::new(EventKind::Removed, format!("removed {}", id)).with_entity(*id));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{MemorySink, NullSink};

    const CALCIUM: &str = r#"
name = "calcium"

[[entity_types]]
name = "bloodCalcium"
kind = "molecule"
quantities = { calcium = { value = 2.15, unit = "concentration" } }

[[entities]]
type = "bloodCalcium"

[[processes]]
name = "pthResorption"
subject = "bloodCalcium"
group = "raiseCalcium"
rate_law = { kind = "zeroOrder", k = 0.05 }
terms = [{ quantity = "calcium", coefficient = 1.0 }]

[[regulators]]
name = "calciumHomeostasis"
entity_type = "bloodCalcium"
quantity = "calcium"
set_point = 2.3
deadband = 0.1
low_group = "raiseCalcium"
"#;

    fn calcium(report: &TickReport) -> f64 {
        report.records[0].value("calcium").unwrap()
    }

    #[test]
    fn test_engine_creation() {
        let engine = SimulationEngine::from_toml_str(CALCIUM).unwrap();
        assert_eq!(engine.registry().len(), 1);
        assert_eq!(engine.time(), 0.0);
        assert_eq!(engine.phase("calciumHomeostasis"), Some(RegulatoryPhase::WithinRange));
    }

    #[test]
    fn test_correction_activates_then_releases() {
        let mut engine = SimulationEngine::from_toml_str(CALCIUM).unwrap();

        let t1 = engine.step().unwrap();
        assert_eq!(t1.phases["calciumHomeostasis"], RegulatoryPhase::DeviatingLow);
        assert!(t1.active_groups.contains("raiseCalcium"));
        assert!((calcium(&t1) - 2.2).abs() < 1e-9);

        let t2 = engine.step().unwrap();
        assert!(calcium(&t2) >= 2.2 - 1e-9);
        assert_eq!(t2.phases["calciumHomeostasis"], RegulatoryPhase::WithinRange);
        assert!(t2.active_groups.is_empty());
        assert!((calcium(&t2) - calcium(&t1)).abs() < 1e-12);
    }

    #[test]
    fn test_run_until_lands_on_target() {
        let mut engine = SimulationEngine::from_toml_str(CALCIUM).unwrap();
        let summary = engine.run_until(2.5, &mut NullSink).unwrap();
        assert_eq!(summary.reason, StopReason::Completed);
        assert_eq!(summary.ticks, 3);
        assert!((engine.time() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_cancel_before_run() {
        let mut engine = SimulationEngine::from_toml_str(CALCIUM).unwrap();
        engine.cancel_handle().cancel();
        let mut sink = MemorySink::new();
        let summary = engine.run_ticks(10, &mut sink).unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(summary.ticks, 0);
        assert!(sink.is_empty());

        // The cancellation was consumed
        let summary = engine.run_ticks(2, &mut sink).unwrap();
        assert_eq!(summary.ticks, 2);
    }

    #[test]
    fn test_cancel_handle_survives_load() {
        let mut engine = SimulationEngine::from_toml_str(CALCIUM).unwrap();
        let handle = engine.cancel_handle();
        engine.step().unwrap();
        let mut buffer = Vec::new();
        engine.save(&mut buffer).unwrap();
        engine.step().unwrap();

        engine.load(buffer.as_slice()).unwrap();
        assert_eq!(engine.tick_count(), 1);
        handle.cancel();
        let summary = engine.run_ticks(5, &mut NullSink).unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(summary.ticks, 0);
        assert_eq!(engine.tick_count(), 1);
    }

    #[test]
    fn test_zero_wall_timeout() {
        let mut engine = SimulationEngine::from_toml_str(CALCIUM).unwrap();
        let summary = engine
            .run_for(100.0, Some(Duration::ZERO), &mut NullSink)
            .unwrap();
        assert_eq!(summary.reason, StopReason::TimedOut);
    }

    #[test]
    fn test_rejected_mutation_drops_only_its_origin() {
        let text = format!(
            "{}\n{}",
            CALCIUM,
            r#"
[[entity_types]]
name = "marker"
kind = "molecule"
quantities = { signal = { value = 1.5e308, unit = "dimensionless" } }

[[entities]]
type = "marker"

[[processes]]
name = "runaway"
subject = "marker"
rate_law = { kind = "zeroOrder", k = 1e308 }
terms = [{ quantity = "signal", coefficient = 1.0 }]
"#
        );
        let mut engine = SimulationEngine::from_toml_str(&text).unwrap();
        let report = engine.step().unwrap();

        let rejected: Vec<_> = report
            .events
            .iter()
            .filter(|e| e.kind == EventKind::InvariantViolation)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].source.as_deref(), Some("runaway"));
        assert!(report.partially_failed());

        // The calcium correction still committed
        let calcium = report.records_of_type("bloodCalcium").next().unwrap();
        assert!((calcium.value("calcium").unwrap() - 2.2).abs() < 1e-9);
        let marker = report.records_of_type("marker").next().unwrap();
        assert_eq!(marker.value("signal"), Some(1.5e308));
    }

    #[test]
    fn test_save_and_load_resume_identically() {
        let mut engine = SimulationEngine::from_toml_str(CALCIUM).unwrap();
        engine.step().unwrap();
        let mut buffer = Vec::new();
        engine.save(&mut buffer).unwrap();

        let expected = engine.step().unwrap();

        let mut resumed = SimulationEngine::from_toml_str(CALCIUM).unwrap();
        resumed.load(buffer.as_slice()).unwrap();
        assert_eq!(resumed.phase("calciumHomeostasis"), Some(RegulatoryPhase::DeviatingLow));
        assert_eq!(resumed.step().unwrap(), expected);
    }
}
