//! biosim Headless Scenario Harness
//!
//! Runs every bundled scenario in-process and checks the outcomes a
//! physiologist would expect: set-point recovery, mass balance, cycle
//! progression, deterministic replay.
//!
//! Usage:
//!   cargo run -p biosim-simtest
//!   cargo run -p biosim-simtest -- --verbose
//!   RUST_LOG=debug cargo run -p biosim-simtest

use std::sync::Arc;
use std::time::Duration;

use biosim_core::prelude::*;

// ── Bundled scenarios ───────────────────────────────────────────────────
const CALCIUM_TOML: &str = include_str!("../../../data/calcium_homeostasis.toml");
const BONE_TOML: &str = include_str!("../../../data/bone_remodeling.toml");
const COLLAGEN_TOML: &str = include_str!("../../../data/collagen_crosslinking.toml");

const SCENARIOS: &[(&str, &str)] = &[
    ("calcium_homeostasis", CALCIUM_TOML),
    ("bone_remodeling", BONE_TOML),
    ("collagen_crosslinking", COLLAGEN_TOML),
];

const DAY: f64 = 86400.0;

// ── Test harness ────────────────────────────────────────────────────────

struct TestResult {
    name: String,
    passed: bool,
    detail: String,
}

fn check(name: &str, passed: bool, detail: impl Into<String>) -> TestResult {
    TestResult {
        name: name.into(),
        passed,
        detail: detail.into(),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let verbose = std::env::args().any(|a| a == "--verbose");
    println!("=== biosim Scenario Harness ===\n");

    let mut results = Vec::new();

    // 1. Scenario loading and validation
    results.extend(validate_scenario_loading(verbose));

    // 2. Calcium set-point regulation
    results.extend(validate_calcium_regulation(verbose));

    // 3. Collagen crosslinking kinetics
    results.extend(validate_collagen_kinetics(verbose));

    // 4. Bone remodeling cycle
    results.extend(validate_bone_remodeling(verbose));

    // 5. Save / load
    results.extend(validate_persistence(verbose));

    // 6. Cancellation and timeouts
    results.extend(validate_run_control(verbose));

    // ── Summary ──
    println!();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.iter().filter(|r| !r.passed).count();
    let total = results.len();

    for r in &results {
        let icon = if r.passed { "✓" } else { "✗" };
        if !r.passed || verbose {
            println!("  {} {}: {}", icon, r.name, r.detail);
        }
    }

    println!(
        "\n=== RESULT: {}/{} passed, {} failed ===",
        passed, total, failed
    );

    if failed > 0 {
        log::warn!("{} of {} checks failed", failed, total);
        std::process::exit(1);
    }
}

fn load(name: &str, text: &str) -> Result<Arc<Definitions>, TestResult> {
    Definitions::from_toml_str(text)
        .map(Arc::new)
        .map_err(|e| check(&format!("{}_load", name), false, format!("load error: {}", e)))
}

fn engine_for(name: &str, defs: &Arc<Definitions>) -> Result<SimulationEngine, TestResult> {
    SimulationEngine::new(Arc::clone(defs))
        .map_err(|e| check(&format!("{}_engine", name), false, format!("engine error: {}", e)))
}

fn pool_value(report: &TickReport, entity_type: &str, quantity: &str) -> Option<f64> {
    report
        .records_of_type(entity_type)
        .next()
        .and_then(|r| r.value(quantity))
}

fn negative_conserved(reports: &[TickReport]) -> usize {
    reports
        .iter()
        .flat_map(|r| r.records.iter())
        .map(|rec| {
            rec.conserved
                .iter()
                .filter(|q| rec.value(q).map_or(false, |v| v < 0.0))
                .count()
        })
        .sum()
}

// ── 1. Scenario Loading ─────────────────────────────────────────────────

fn validate_scenario_loading(verbose: bool) -> Vec<TestResult> {
    println!("--- Scenario Loading ---");
    let mut results = Vec::new();

    for (name, text) in SCENARIOS {
        match Definitions::from_toml_str(text) {
            Ok(defs) => {
                if verbose {
                    println!(
                        "  {}: {} types, {} initial entities, {} processes, {} rules, {} regulators, {} relations",
                        name,
                        defs.types.len(),
                        defs.initial.len(),
                        defs.processes.len(),
                        defs.lifecycle_rules.len(),
                        defs.regulators.len(),
                        defs.relations.edge_count()
                    );
                }
                results.push(check(
                    &format!("{}_loads", name),
                    !defs.initial.is_empty() && !defs.processes.is_empty(),
                    format!(
                        "{} entities, {} processes",
                        defs.initial.len(),
                        defs.processes.len()
                    ),
                ));
            }
            Err(e) => results.push(check(&format!("{}_loads", name), false, e.to_string())),
        }
    }

    // Unknown constant must stop the run before it starts
    let broken = CALCIUM_TOML.replace("\"PTH_RELEASE\"", "\"PTH_RELASE\"");
    results.push(match Definitions::from_toml_str(&broken) {
        Err(SimError::Configuration(msg)) => check("unknown_constant_rejected", true, msg),
        Err(e) => check("unknown_constant_rejected", false, format!("wrong error: {}", e)),
        Ok(_) => check("unknown_constant_rejected", false, "scenario was accepted"),
    });

    // Negative deadband
    let broken = CALCIUM_TOML.replace("CA_DEADBAND = 0.1", "CA_DEADBAND = -0.1");
    results.push(check(
        "negative_deadband_rejected",
        matches!(
            Definitions::from_toml_str(&broken),
            Err(SimError::Configuration(_))
        ),
        "deadband < 0",
    ));

    results
}

// ── 2. Calcium Regulation ───────────────────────────────────────────────

fn calcium_engine(initial: f64) -> Result<SimulationEngine, TestResult> {
    let mut config = ScenarioConfig::from_toml_str(CALCIUM_TOML)
        .map_err(|e| check("calcium_config", false, e.to_string()))?;
    if let Some(pool) = config.entities.first_mut() {
        pool.quantities.insert("calcium".to_string(), initial);
    }
    SimulationEngine::from_config(config).map_err(|e| check("calcium_engine", false, e.to_string()))
}

fn validate_calcium_regulation(verbose: bool) -> Vec<TestResult> {
    println!("--- Calcium Regulation ---");
    let mut results = Vec::new();

    // Starts just below the band: one corrective tick, then release
    let mut engine = match calcium_engine(2.15) {
        Ok(e) => e,
        Err(r) => return vec![r],
    };
    let mut sink = MemorySink::new();
    if let Err(e) = engine.run_ticks(2, &mut sink) {
        return vec![check("calcium_run", false, e.to_string())];
    }
    let (tick1, tick2) = (&sink.reports[0], &sink.reports[1]);
    let after1 = pool_value(tick1, "bloodCalcium", "calcium").unwrap_or(f64::NAN);
    results.push(check(
        "low_calcium_activates_release",
        tick1.active_groups.contains("raiseCalcium") && (after1 - 2.2).abs() < 1e-6,
        format!("groups {:?}, calcium {:.4} after tick 1", tick1.active_groups, after1),
    ));
    results.push(check(
        "release_deactivates_in_band",
        tick2.active_groups.is_empty()
            && engine.phase("calciumHomeostasis") == Some(RegulatoryPhase::WithinRange),
        format!("groups {:?} on tick 2", tick2.active_groups),
    ));

    // Perturbed two deadbands above the set-point
    let mut engine = match calcium_engine(2.5) {
        Ok(e) => e,
        Err(r) => return results.into_iter().chain([r]).collect(),
    };
    let mut recovered_at = None;
    for _ in 0..5 {
        match engine.step() {
            Ok(report) => {
                let v = pool_value(&report, "bloodCalcium", "calcium").unwrap_or(f64::NAN);
                if verbose {
                    println!(
                        "  tick {}: calcium {:.4} ({})",
                        report.tick, v, report.phases["calciumHomeostasis"]
                    );
                }
                if (2.2 - 1e-9..=2.4 + 1e-9).contains(&v) {
                    recovered_at = Some(report.tick);
                    break;
                }
            }
            Err(e) => {
                results.push(check("perturbation_run", false, e.to_string()));
                return results;
            }
        }
    }
    results.push(check(
        "perturbation_returns_to_band",
        recovered_at.is_some(),
        match recovered_at {
            Some(t) => format!("back in [2.2, 2.4] after {} ticks", t),
            None => "still outside the band after 5 ticks".into(),
        },
    ));

    results
}

// ── 3. Collagen Kinetics ────────────────────────────────────────────────

fn validate_collagen_kinetics(verbose: bool) -> Vec<TestResult> {
    println!("--- Collagen Kinetics ---");
    let mut results = Vec::new();

    let defs = match load("collagen", COLLAGEN_TOML) {
        Ok(d) => d,
        Err(r) => return vec![r],
    };
    let mut engine = match engine_for("collagen", &defs) {
        Ok(e) => e,
        Err(r) => return vec![r],
    };
    let initial: Vec<(EntityId, f64)> = engine
        .snapshot()
        .of_type("collagenFibril")
        .filter_map(|f| f.value("lysine").map(|v| (f.id, v)))
        .collect();

    let mut sink = MemorySink::new();
    if let Err(e) = engine.run_ticks(120, &mut sink) {
        return vec![check("collagen_run", false, e.to_string())];
    }
    let Some(last) = sink.last() else {
        return vec![check("collagen_run", false, "no reports")];
    };

    let worst = initial
        .iter()
        .filter_map(|(id, lysine0)| {
            let r = last.record(*id)?;
            let total = r.value("lysine")? + r.value("allysine")? + 2.0 * r.value("crosslinks")?;
            Some((total - lysine0).abs())
        })
        .fold(0.0, f64::max);
    results.push(check(
        "lysine_mass_balance",
        worst < 1e-9 && initial.len() == 8,
        format!("{} fibrils, worst drift {:.2e}", initial.len(), worst),
    ));

    let crosslinks: f64 = last
        .records_of_type("collagenFibril")
        .filter_map(|r| r.value("crosslinks"))
        .sum();
    if verbose {
        println!("  crosslinks after 2 h: {:.4} mmol/L total", crosslinks);
    }
    results.push(check(
        "crosslinks_form",
        crosslinks > 0.0,
        format!("{:.4} mmol/L", crosslinks),
    ));

    let negatives = negative_conserved(&sink.reports);
    results.push(check(
        "conserved_pools_non_negative",
        negatives == 0,
        format!("{} negative conserved values", negatives),
    ));

    let contention = sink
        .events()
        .filter(|e| e.kind == EventKind::Contention)
        .count();
    let ascorbate = pool_value(last, "ascorbate", "ascorbate").unwrap_or(f64::NAN);
    results.push(check(
        "ascorbate_contention_scaled",
        contention > 0 && ascorbate.abs() < 1e-12,
        format!("{} contention events, ascorbate {:.2e}", contention, ascorbate),
    ));

    // Same scenario evaluated on one thread
    let mut config = match ScenarioConfig::from_toml_str(COLLAGEN_TOML) {
        Ok(c) => c,
        Err(e) => {
            results.push(check("collagen_sequential", false, e.to_string()));
            return results;
        }
    };
    config.simulation.parallel = false;
    let mut sequential = MemorySink::new();
    let matched = SimulationEngine::from_config(config)
        .and_then(|mut e| e.run_ticks(120, &mut sequential))
        .map(|_| sequential.reports == sink.reports);
    results.push(check(
        "parallel_matches_sequential",
        matches!(matched, Ok(true)),
        "120 ticks compared",
    ));

    results
}

// ── 4. Bone Remodeling ──────────────────────────────────────────────────

fn validate_bone_remodeling(verbose: bool) -> Vec<TestResult> {
    println!("--- Bone Remodeling ---");
    let mut results = Vec::new();

    let defs = match load("bone", BONE_TOML) {
        Ok(d) => d,
        Err(r) => return vec![r],
    };
    let mut engine = match engine_for("bone", &defs) {
        Ok(e) => e,
        Err(r) => return vec![r],
    };

    let mut sink = MemorySink::new();
    let summary = match engine.run_until(365.0 * DAY, &mut sink) {
        Ok(s) => s,
        Err(e) => return vec![check("bone_run", false, e.to_string())],
    };
    if verbose {
        println!(
            "  {} ticks over {:.0} days, {} live entities, {} recovered errors",
            summary.ticks,
            (summary.end_time - summary.start_time) / DAY,
            engine.registry().len(),
            summary.errors
        );
    }
    results.push(check(
        "year_completes",
        summary.reason == StopReason::Completed && (engine.time() - 365.0 * DAY).abs() < 1e-6,
        format!("{:?} at t={:.0}s after {} ticks", summary.reason, engine.time(), summary.ticks),
    ));

    let count = |kind: EventKind| sink.events().filter(|e| e.kind == kind).count();
    let (transitions, spawned, removed) = (
        count(EventKind::Transition),
        count(EventKind::Spawned),
        count(EventKind::Removed),
    );
    results.push(check(
        "cycle_progresses",
        transitions > 0 && spawned > 0 && removed > 0,
        format!(
            "{} transitions, {} spawned, {} removed",
            transitions, spawned, removed
        ),
    ));

    let completed = sink
        .events()
        .filter(|e| e.kind == EventKind::Transition && e.message.ends_with("-> quiescent"))
        .count();
    results.push(check(
        "sites_complete_cycles",
        completed > 0,
        format!("{} completed remodeling cycles", completed),
    ));

    let negatives = negative_conserved(&sink.reports);
    results.push(check(
        "bone_pools_non_negative",
        negatives == 0,
        format!("{} negative conserved values", negatives),
    ));

    let (min_dt, max_dt) = sink
        .reports
        .iter()
        .fold((f64::INFINITY, 0.0f64), |(lo, hi), r| (lo.min(r.dt), hi.max(r.dt)));
    results.push(check(
        "variable_steps_in_bounds",
        min_dt > 0.0 && max_dt <= 604800.0,
        format!("dt in [{:.0}, {:.0}] s", min_dt, max_dt),
    ));

    // Deterministic replay from the same definitions
    let mut replay = MemorySink::new();
    let identical = SimulationEngine::new(Arc::clone(&defs))
        .and_then(|mut e| e.run_until(365.0 * DAY, &mut replay))
        .map(|_| replay.reports == sink.reports);
    results.push(check(
        "bone_deterministic",
        matches!(identical, Ok(true)),
        format!("{} reports compared", sink.len()),
    ));

    results
}

// ── 5. Persistence ──────────────────────────────────────────────────────

fn validate_persistence(_verbose: bool) -> Vec<TestResult> {
    println!("--- Persistence ---");
    let mut results = Vec::new();

    let defs = match load("persistence", BONE_TOML) {
        Ok(d) => d,
        Err(r) => return vec![r],
    };
    let mut engine = match engine_for("persistence", &defs) {
        Ok(e) => e,
        Err(r) => return vec![r],
    };

    let resumed = (|| -> SimResult<bool> {
        engine.run_until(60.0 * DAY, &mut NullSink)?;
        let mut buffer = Vec::new();
        engine.save(&mut buffer)?;

        let mut restored = SimulationEngine::new(Arc::clone(&defs))?;
        restored.load(buffer.as_slice())?;

        let mut a = MemorySink::new();
        let mut b = MemorySink::new();
        engine.run_until(120.0 * DAY, &mut a)?;
        restored.run_until(120.0 * DAY, &mut b)?;
        Ok(a.reports == b.reports)
    })();
    results.push(match resumed {
        Ok(same) => check("save_load_resumes", same, "60 days saved, 60 more compared"),
        Err(e) => check("save_load_resumes", false, e.to_string()),
    });

    let json = engine.state_snapshot().to_json();
    results.push(check(
        "json_snapshot",
        json.as_ref().map_or(false, |j| j.contains("\"remodelingSite\"")),
        match &json {
            Ok(j) => format!("{} bytes", j.len()),
            Err(e) => e.to_string(),
        },
    ));

    results
}

// ── 6. Run Control ──────────────────────────────────────────────────────

fn validate_run_control(_verbose: bool) -> Vec<TestResult> {
    println!("--- Run Control ---");
    let mut results = Vec::new();

    let defs = match load("run_control", BONE_TOML) {
        Ok(d) => d,
        Err(r) => return vec![r],
    };

    let cancelled = engine_for("cancel", &defs).and_then(|mut engine| {
        engine.cancel_handle().cancel();
        engine
            .run_until(365.0 * DAY, &mut NullSink)
            .map(|s| (s.reason, s.ticks))
            .map_err(|e| check("cancel_run", false, e.to_string()))
    });
    results.push(match cancelled {
        Ok((reason, ticks)) => check(
            "cancel_stops_between_ticks",
            reason == StopReason::Cancelled && ticks == 0,
            format!("{:?} after {} ticks", reason, ticks),
        ),
        Err(r) => r,
    });

    let timed_out = engine_for("timeout", &defs).and_then(|mut engine| {
        engine
            .run_for(365.0 * DAY, Some(Duration::ZERO), &mut NullSink)
            .map(|s| s.reason)
            .map_err(|e| check("timeout_run", false, e.to_string()))
    });
    results.push(match timed_out {
        Ok(reason) => check(
            "wall_timeout_stops_run",
            reason == StopReason::TimedOut,
            format!("{:?}", reason),
        ),
        Err(r) => r,
    });

    results
}
