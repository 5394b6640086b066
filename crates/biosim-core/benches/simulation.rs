//! Tick throughput benchmarks

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use biosim_core::prelude::*;
use biosim_core::systems::{hill_kinetics, michaelis_menten};

const BONE_TOML: &str = include_str!("../../../data/bone_remodeling.toml");
const COLLAGEN_TOML: &str = include_str!("../../../data/collagen_crosslinking.toml");

fn bench_bone_ticks(c: &mut Criterion) {
    let defs = Arc::new(Definitions::from_toml_str(BONE_TOML).unwrap());

    c.bench_function("bone_remodeling_100_ticks", |b| {
        b.iter_batched(
            || SimulationEngine::new(Arc::clone(&defs)).unwrap(),
            |mut engine| engine.run_ticks(100, &mut NullSink).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

fn bench_collagen_parallel(c: &mut Criterion) {
    let mut config = ScenarioConfig::from_toml_str(COLLAGEN_TOML).unwrap();
    config.populations[0].count = 500;
    let parallel = Arc::new(Definitions::from_config(config.clone()).unwrap());
    config.simulation.parallel = false;
    let sequential = Arc::new(Definitions::from_config(config).unwrap());

    for (name, defs) in [("collagen_500_parallel", parallel), ("collagen_500_sequential", sequential)] {
        c.bench_function(name, |b| {
            b.iter_batched(
                || SimulationEngine::new(Arc::clone(&defs)).unwrap(),
                |mut engine| engine.run_ticks(10, &mut NullSink).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
}

fn bench_rate_laws(c: &mut Criterion) {
    c.bench_function("michaelis_menten", |b| {
        b.iter(|| michaelis_menten(black_box(0.002), black_box(0.05), black_box(0.7)))
    });
    c.bench_function("hill_kinetics", |b| {
        b.iter(|| hill_kinetics(black_box(0.001), black_box(0.2), black_box(0.3), black_box(2.5)))
    });
}

criterion_group!(benches, bench_bone_ticks, bench_collagen_parallel, bench_rate_laws);
criterion_main!(benches);
