//! Benchmarks for the uncontended admission fast path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use resgov_common::types::{CapabilitySet, GroupId};
use resgov_core::registry::RuntimeRegistry;

fn bench_acquire_release(c: &mut Criterion) {
    let registry = RuntimeRegistry::new(1 << 30);
    let id = GroupId::new(2);
    registry.materialize(
        id,
        CapabilitySet {
            concurrency_limit: 0,
            memory_limit_pct: 50,
            ..CapabilitySet::default()
        },
    );

    c.bench_function("acquire_release_uncontended", |b| {
        b.iter(|| {
            let grant = registry
                .try_acquire(black_box(id), black_box(4096))
                .unwrap()
                .unwrap();
            drop(grant);
        });
    });

    c.bench_function("group_stats_snapshot", |b| {
        b.iter(|| black_box(registry.group_stats(id)));
    });
}

criterion_group!(benches, bench_acquire_release);
criterion_main!(benches);
