//! Benchmarks for graph traversal.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use privacy_engine::core::IdentitySeeds;
use privacy_engine::graph::{CollectionConfig, DatasetConfig, FieldConfig, FieldReferenceConfig, Traversal};
use serde_json::json;

/// A chain of `depth` collections, each referencing the previous one by id.
fn chain_dataset(depth: usize) -> DatasetConfig {
    let mut dataset = DatasetConfig::new("bench", "db").with_collection(
        CollectionConfig::new("c0")
            .with_field(FieldConfig::new("id").primary_key())
            .with_field(FieldConfig::new("email").with_identity("email")),
    );
    for i in 1..depth {
        dataset = dataset.with_collection(
            CollectionConfig::new(format!("c{i}"))
                .with_field(FieldConfig::new("id").primary_key())
                .with_field(
                    FieldConfig::new("parent_id")
                        .with_reference(FieldReferenceConfig::from("bench", format!("c{}.id", i - 1))),
                ),
        );
    }
    dataset
}

fn traversal_benchmark(c: &mut Criterion) {
    let seeds: IdentitySeeds = [("email".to_string(), json!("a@b.c"))].into_iter().collect();
    let mut group = c.benchmark_group("traversal_build");
    for depth in [10, 100, 500] {
        let datasets = vec![chain_dataset(depth)];
        group.bench_with_input(BenchmarkId::from_parameter(depth), &datasets, |b, datasets| {
            b.iter(|| Traversal::build(black_box(datasets), black_box(&seeds)));
        });
    }
    group.finish();

    let traversal = Traversal::build(&[chain_dataset(100)], &seeds).unwrap();
    c.bench_function("erasure_order_100", |b| b.iter(|| black_box(&traversal).erasure_order()));
}

criterion_group!(benches, traversal_benchmark);
criterion_main!(benches);
