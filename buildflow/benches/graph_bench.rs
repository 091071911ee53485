//! Benchmarks for stage graph loading and readiness.

use buildflow::pipeline::{StageDefinition, StageGraph};
use buildflow::core::StageStatus;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// A layered graph: each stage depends on up to three stages of the layer above.
fn layered(layers: usize, width: usize) -> Vec<StageDefinition> {
    let mut definitions = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for i in 0..width {
            let deps: Vec<String> = if layer == 0 {
                Vec::new()
            } else {
                (0..3)
                    .map(|k| format!("s{}_{}", layer - 1, (i + k) % width))
                    .collect()
            };
            definitions.push(
                StageDefinition::new(format!("s{layer}_{i}"), "true")
                    .with_order(i as i64)
                    .with_dependencies(deps),
            );
        }
    }
    definitions
}

fn graph_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph");
    for (layers, width) in [(10, 10), (40, 25)] {
        let definitions = layered(layers, width);
        let size = definitions.len();

        group.bench_with_input(BenchmarkId::new("load", size), &definitions, |b, defs| {
            b.iter(|| StageGraph::load(black_box(defs.clone())).unwrap());
        });

        let mut graph = StageGraph::load(definitions).unwrap();
        for name in graph.ready_set() {
            graph.mark(&name, StageStatus::Running).unwrap();
            graph.mark(&name, StageStatus::Completed).unwrap();
        }
        group.bench_function(BenchmarkId::new("ready_set", size), |b| {
            b.iter(|| black_box(graph.ready_set()));
        });
    }
    group.finish();
}

criterion_group!(benches, graph_benchmark);
criterion_main!(benches);
