//! Conflict resolution benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use driftsync_bench::{edit_every, random_payload};
use driftsync_conflict::{
    ConflictCase, ConflictResolver, FieldMergeResolver, ResolverConfig, ResolverRegistry, ResolutionOutcome,
};
use serde_json::json;

/// Benchmark building a case, which computes per-field divergence.
fn bench_case(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflict_case");
    for fields in [16usize, 128] {
        let base = random_payload(fields);
        let local = edit_every(&base, 4, 0);
        let remote = edit_every(&base, 4, 1);
        group.bench_with_input(BenchmarkId::from_parameter(fields), &fields, |b, _| {
            b.iter(|| {
                black_box(ConflictCase::new(
                    "items",
                    "r1",
                    Some(base.clone()),
                    local.clone(),
                    remote.clone(),
                ))
            });
        });
    }
    group.finish();
}

/// Benchmark the field merge resolver on disjoint and overlapping edits.
fn bench_field_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_merge");
    let resolver = FieldMergeResolver::new(ResolverConfig::default());
    let base = random_payload(64);

    let disjoint = ConflictCase::new(
        "items",
        "r1",
        Some(base.clone()),
        edit_every(&base, 4, 0),
        edit_every(&base, 4, 1),
    );
    group.bench_function("disjoint", |b| {
        b.iter(|| black_box(resolver.resolve(black_box(&disjoint))));
    });

    let overlapping = ConflictCase::new(
        "items",
        "r1",
        Some(base.clone()),
        edit_every(&base, 2, 0),
        edit_every(&base, 4, 0),
    );
    group.bench_function("overlapping", |b| {
        b.iter(|| black_box(resolver.resolve(black_box(&overlapping))));
    });

    let nested = |tags: serde_json::Value, count: i64| {
        json!({
            "profile": {"name": "A", "tags": tags},
            "items": [{"id": 1, "qty": count}, {"id": 2, "qty": 1}],
            "count": count,
        })
        .as_object()
        .cloned()
        .unwrap_or_default()
    };
    let structured = ConflictCase::new(
        "items",
        "r1",
        Some(nested(json!(["a"]), 1)),
        nested(json!(["a", "b"]), 2),
        nested(json!(["a", "c"]), 3),
    );
    group.bench_function("structured", |b| {
        b.iter(|| black_box(resolver.resolve(black_box(&structured))));
    });
    group.finish();
}

/// Benchmark registry dispatch with recorded history.
fn bench_registry(c: &mut Criterion) {
    let registry = ResolverRegistry::new(ResolverConfig::default());
    let base = random_payload(32);
    let case = ConflictCase::new(
        "items",
        "r1",
        Some(base.clone()),
        edit_every(&base, 3, 0),
        edit_every(&base, 3, 1),
    );
    for _ in 0..100 {
        let resolution = registry.resolve(&case);
        registry.record_outcome(&case, &resolution, ResolutionOutcome::Succeeded);
    }

    c.bench_function("registry_resolve_with_history", |b| {
        b.iter(|| black_box(registry.resolve(black_box(&case))));
    });
}

criterion_group!(benches, bench_case, bench_field_merge, bench_registry);

criterion_main!(benches);
