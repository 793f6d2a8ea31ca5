//! Benchmarks for per-batch metric reduction.
//!
//! Every eval and decode batch folds its weighted scalars into a running
//! mean and merges its metric tree into the split's accumulator, so both
//! sit on the per-step hot path.

use cadence_eval::{Accumulator, Collect, DeviceValues, MeanMetrics, MetricTree, WeightedScalars};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn batch_tree(batch: usize) -> MetricTree {
    let b = batch as f64;
    let inner = MetricTree::new().with("tokens", Accumulator::sum(b * 32.0)).with("max_len", Accumulator::max(b));
    MetricTree::new()
        .with("loss", Accumulator::mean(1.0 / (1.0 + b), 32.0))
        .with("min_logprob", Accumulator::min(-b))
        .with("len_hist", Accumulator::histogram(vec![0.0, 8.0, 16.0, 32.0], &[b % 40.0]))
        .with("lengths", Accumulator::nested(inner))
}

fn batch_scalars(batch: usize, keys: usize) -> WeightedScalars {
    (0..keys).fold(WeightedScalars::new(), |acc, k| acc.with(format!("metric_{k}"), ((batch * k) % 100) as f64 / 100.0, 16.0))
}

fn bench_metric_tree_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("metric_tree_absorb");
    for batches in [10usize, 100, 1000] {
        let trees: Vec<MetricTree> = (0..batches).map(batch_tree).collect();
        group.bench_with_input(BenchmarkId::from_parameter(batches), &trees, |b, trees| {
            b.iter(|| {
                let mut total = MetricTree::new();
                for tree in trees {
                    total.absorb(tree.clone()).unwrap();
                }
                black_box(total.summarize())
            });
        });
    }
    group.finish();
}

fn bench_mean_metrics_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("mean_metrics_store");
    for keys in [4usize, 32] {
        let batches: Vec<WeightedScalars> = (0..200).map(|b| batch_scalars(b, keys)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(keys), &batches, |b, batches| {
            b.iter(|| {
                let mut metrics = MeanMetrics::new();
                for scalars in batches {
                    metrics.store(scalars);
                }
                black_box(metrics.get("metric_1"))
            });
        });
    }
    group.finish();
}

fn bench_cross_device_reduce(c: &mut Criterion) {
    let per_device: Vec<WeightedScalars> = (0..8).map(|d| batch_scalars(d, 32)).collect();
    c.bench_function("weighted_scalars_all_reduce_8_devices", |b| {
        b.iter(|| black_box(DeviceValues::PerDevice(per_device.clone()).into_host().unwrap()));
    });
    let trees: Vec<MetricTree> = (0..8).map(batch_tree).collect();
    c.bench_function("metric_tree_all_reduce_8_devices", |b| {
        b.iter(|| black_box(MetricTree::all_reduce(trees.clone()).unwrap()));
    });
}

criterion_group!(benches, bench_metric_tree_merge, bench_mean_metrics_store, bench_cross_device_reduce);
criterion_main!(benches);
