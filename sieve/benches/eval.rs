//! Benchmarks for fingerprinting, planning and evaluation.
//!
//! Run with: `cargo bench -p sieve -- eval`

#![allow(missing_docs, clippy::cast_precision_loss)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use sieve::ast::{Expr, Grouping, Selector};
use sieve::metric::Metric;
use sieve::storage::MemoryStorage;
use sieve::{Engine, Frames};

/// A storage with `series` counters sampled every 15s for an hour.
fn setup_storage(series: u32) -> MemoryStorage {
    let mut storage = MemoryStorage::default();
    for i in 0..series {
        let metric = Metric::new([
            ("__name__", "http_requests_total".to_string()),
            ("job", format!("job-{}", i % 10)),
            ("instance", format!("host-{i}")),
        ]);
        storage.insert_series(&metric, (0..240).map(|s| (s * 15_000, (s * i64::from(i + 1)) as f64)));
    }
    storage
}

fn hour() -> Frames {
    Frames::new(300_000, 3_585_000, 15_000).unwrap()
}

fn bench_fingerprint(c: &mut Criterion) {
    let metric = Metric::new([
        ("__name__", "http_requests_total"),
        ("job", "api"),
        ("instance", "host-1:9090"),
        ("region", "eu-west-1"),
    ]);
    c.bench_function("fingerprint", |b| b.iter(|| black_box(&metric).fingerprint()));
    c.bench_function("metric_build", |b| {
        b.iter(|| {
            Metric::new(black_box([
                ("__name__", "http_requests_total"),
                ("job", "api"),
                ("instance", "host-1:9090"),
            ]))
        });
    });
}

fn bench_plan(c: &mut Criterion) {
    let storage = setup_storage(100);
    let engine = Engine::default();
    let expr = Expr::binary("/", Expr::metric("http_requests_total"), Expr::metric("http_requests_total"));
    c.bench_function("plan_fixed_pairing_100", |b| {
        b.iter(|| engine.plan(black_box(&expr), &storage).unwrap());
    });
}

fn bench_eval(c: &mut Criterion) {
    let mut group = c.benchmark_group("eval");
    let engine = Engine::default();
    let frames = hour();

    for series in [10u32, 100, 1000] {
        let storage = setup_storage(series);
        let rate = Expr::call("rate", vec![Expr::range(Selector::named("http_requests_total"), 300_000)]);
        let sum_rate = Expr::aggregate("sum", None, rate.clone(), Some(Grouping::by(["job"])));
        let topk = Expr::aggregate("topk", Some(Expr::number(5.0)), rate.clone(), None);

        for (name, expr) in [("rate", &rate), ("sum_rate", &sum_rate), ("topk_rate", &topk)] {
            let plan = engine.plan(expr, &storage).unwrap();
            group.bench_with_input(BenchmarkId::new(name, series), &plan, |b, plan| {
                b.iter(|| engine.evaluate(black_box(plan), &frames, &storage).unwrap());
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_plan, bench_eval);
criterion_main!(benches);
