use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use stagec::callgraph::extract_call_graph;
use stagec::config::Options;
use stagec::expr::Expr;
use stagec::pipeline::{Func, Pipeline};
use stagec::scenarios;

// KPI-aligned benchmark scenarios: the bundled wrap pipelines plus a
// generated wrap-on-wrap chain for scaling.

const PHASE_SCENARIOS: [&str; 3] = ["global_wrap", "update_defined_after_wrap", "multi_folds_wrapper"];

/// `src` read by `readers` stages, then wrapped `depth` times, each wrap
/// taking the previous wrapper as its source.
fn wrap_chain(readers: usize, depth: usize) -> (Pipeline, Func) {
    let mut p = Pipeline::new();
    let src = p.func("src");
    p.define(&src, &["x", "y"], Expr::var("x") + Expr::var("y"))
        .expect("valid definition");
    let funcs: Vec<Func> = (0..readers).map(|i| p.func(&format!("r{}", i))).collect();
    for f in &funcs {
        p.define(f, &["x", "y"], src.at([Expr::var("x"), Expr::var("y")]))
            .expect("valid definition");
    }
    let refs: Vec<&Func> = funcs.iter().collect();
    let mut source = src;
    for _ in 0..depth {
        source = p.wrap(&source, &refs).expect("valid wrap");
        p.schedule(&source).expect("known stage").compute_root();
    }
    (p, funcs[0].clone())
}

// KPI: pipeline construction (definitions + wrap resolution + rewrites).
fn bench_kpi_build_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/build_latency");
    let options = Options::default();

    for scenario in scenarios::all() {
        group.bench_with_input(BenchmarkId::from_parameter(scenario.name), scenario, |b, scenario| {
            b.iter(|| {
                let built = scenario.build(black_box(&options)).expect("scenario must build");
                black_box(built.checks.len());
            });
        });
    }

    group.finish();
}

// KPI: phase-level latency (setup: build).
fn bench_kpi_phase_latency(c: &mut Criterion) {
    let options = Options::default();

    {
        let mut group = c.benchmark_group("kpi/phase_latency/lower");
        for name in PHASE_SCENARIOS {
            let scenario = scenarios::find(name).expect("bundled scenario");
            group.bench_function(name, |b| {
                b.iter_batched(
                    || scenario.build(&options).expect("scenario must build"),
                    |built| {
                        for check in &built.checks {
                            let module = built.pipeline.compile(black_box(&check.output));
                            black_box(&module.is_ok());
                        }
                    },
                    BatchSize::SmallInput,
                );
            });
        }
        group.finish();
    }

    {
        let mut group = c.benchmark_group("kpi/phase_latency/extract_calls");
        for name in PHASE_SCENARIOS {
            let scenario = scenarios::find(name).expect("bundled scenario");
            let built = scenario.build(&options).expect("scenario must build");
            let meta = built.pipeline.stage_meta();
            let modules: Vec<_> = built
                .checks
                .iter()
                .map(|check| built.pipeline.compile(&check.output).expect("scenario must lower"))
                .collect();
            group.bench_function(name, |b| {
                b.iter(|| {
                    for module in &modules {
                        let result = extract_call_graph(black_box(&module.body), &meta);
                        black_box(&result.graph);
                    }
                });
            });
        }
        group.finish();
    }

    {
        let mut group = c.benchmark_group("kpi/phase_latency/realize");
        let scenario = scenarios::find("global_wrap").expect("bundled scenario");
        let built = scenario.build(&options).expect("scenario must build");
        let check = &built.checks[0];
        let extents = [64, 64];
        let inputs = built.inputs(check, &extents);
        group.bench_function("global_wrap_64", |b| {
            b.iter(|| {
                let buffer = built.pipeline.realize(&check.output, black_box(&extents), &inputs);
                black_box(&buffer.is_ok());
            });
        });
        group.finish();
    }
}

// KPI: wrap resolution and lowering vs wrap-chain depth.
fn bench_kpi_wrap_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/wrap_scaling");

    for depth in [1_usize, 4, 16, 64] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}deep", depth)),
            &depth,
            |b, &depth| {
                b.iter(|| {
                    let (p, output) = wrap_chain(8, black_box(depth));
                    let module = p.compile(&output).expect("chain must lower");
                    black_box(module.realized.len());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_kpi_build_latency,
    bench_kpi_phase_latency,
    bench_kpi_wrap_scaling,
);
criterion_main!(benches);
