//! Scheduler - sole authority over the simulation clock.
//!
//! Fixed mode advances by a uniform step. Variable mode jumps to the next
//! pending event (a timed lifecycle rule coming due or a slow process
//! reaching its period), clamped to `[min_dt, max_dt]`.
//!
//! Slow processes are throttled the same way fast and slow systems share
//! one update loop: each remembers when it last ran and integrates over
//! the whole elapsed span once its period has passed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::systems::ProcessDef;

/// Step selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum TickMode {
    Fixed { dt: f64 },
    Variable { min_dt: f64, max_dt: f64 },
}

impl Default for TickMode {
    fn default() -> Self {
        TickMode::Fixed { dt: 1.0 }
    }
}

impl TickMode {
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            TickMode::Fixed { dt } if !(dt > 0.0 && dt.is_finite()) => {
                Err(format!("tick dt must be positive (got {})", dt))
            }
            TickMode::Variable { min_dt, max_dt }
                if !(min_dt > 0.0 && max_dt.is_finite() && min_dt <= max_dt) =>
            {
                Err(format!(
                    "variable tick needs 0 < min_dt <= max_dt (got {} / {})",
                    min_dt, max_dt
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Monotonic tick counter and simulated time (s)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationClock {
    pub tick: u64,
    pub time: f64,
}

impl SimulationClock {
    pub fn at(tick: u64, time: f64) -> Self {
        Self { tick, time }
    }

    fn advance(&mut self, dt: f64) {
        self.tick += 1;
        self.time += dt;
    }
}

/// Cloneable stop flag, observed between ticks only
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Completed,
    Cancelled,
    TimedOut,
}

/// Outcome of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub start_time: f64,
    pub end_time: f64,
    pub reason: StopReason,
    /// Recovered run-time errors reported along the way
    pub errors: usize,
}

/// Last evaluation time of every periodic process, by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateTracker {
    last_eval: BTreeMap<String, f64>,
}

impl RateTracker {
    /// Start every periodic process's clock at `now`
    pub fn new(processes: &[ProcessDef], now: f64) -> Self {
        Self {
            last_eval: processes
                .iter()
                .filter(|p| p.period.is_some())
                .map(|p| (p.name.clone(), now))
                .collect(),
        }
    }

    pub fn from_times(last_eval: BTreeMap<String, f64>) -> Self {
        Self { last_eval }
    }

    pub fn times(&self) -> &BTreeMap<String, f64> {
        &self.last_eval
    }

    fn last(&self, process: &ProcessDef) -> f64 {
        self.last_eval.get(&process.name).copied().unwrap_or(0.0)
    }

    /// Integration span for a tick ending at `end`, or `None` if not due
    pub fn due(&self, process: &ProcessDef, end: f64, dt: f64, tolerance: f64) -> Option<f64> {
        match process.period {
            None => Some(dt),
            Some(period) => {
                let elapsed = end - self.last(process);
                (elapsed >= period - tolerance).then_some(elapsed)
            }
        }
    }

    /// Seconds from `now` until a periodic process comes due
    pub fn until_due(&self, process: &ProcessDef, now: f64) -> Option<f64> {
        process
            .period
            .map(|period| (period - (now - self.last(process))).max(0.0))
    }

    pub fn mark(&mut self, process: &ProcessDef, end: f64) {
        if process.period.is_some() {
            self.last_eval.insert(process.name.clone(), end);
        }
    }
}

pub struct Scheduler {
    mode: TickMode,
    clock: SimulationClock,
    cancel: CancelHandle,
}

impl Scheduler {
    pub fn new(mode: TickMode) -> Self {
        Self {
            mode,
            clock: SimulationClock::default(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn mode(&self) -> TickMode {
        self.mode
    }

    pub fn clock(&self) -> SimulationClock {
        self.clock
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Step for the next tick; `pending` is the soonest known event in
    /// variable mode (ignored in fixed mode).
    pub fn next_dt(&self, pending: Option<f64>) -> f64 {
        match self.mode {
            TickMode::Fixed { dt } => dt,
            TickMode::Variable { min_dt, max_dt } => match pending {
                Some(wait) => wait.clamp(min_dt, max_dt),
                None => max_dt,
            },
        }
    }

    /// Jump to a restored clock; outstanding cancel handles stay bound
    pub(crate) fn set_clock(&mut self, clock: SimulationClock) {
        self.clock = clock;
    }

    pub(crate) fn advance(&mut self, dt: f64) -> SimulationClock {
        self.clock.advance(dt);
        self.clock
    }

    /// Checked between ticks; clears a consumed cancellation
    pub(crate) fn interruption(&self, deadline: Option<Instant>) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            self.cancel.reset();
            return Some(StopReason::Cancelled);
        }
        match deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::TimedOut),
            _ => None,
        }
    }
}
