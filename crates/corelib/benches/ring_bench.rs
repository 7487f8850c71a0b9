// Criterion benchmarks for corelib
//
// Run benchmarks with:
//   cargo bench -p corelib

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use corelib::{hash_key, HashRing, Hashed, NodeId};

fn build_ring(nodes: usize) -> HashRing<Hashed> {
    let ring = HashRing::new();
    for i in 0..nodes {
        let _ = ring.append(Hashed(NodeId::from_name(&format!("svc-{}", i)).ring_hash()));
    }
    ring
}

fn bench_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_hit");

    for node_count in [3, 16, 128].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(node_count), node_count, |b, &count| {
            let ring = build_ring(count);
            let key = hash_key("group-42");
            b.iter(|| ring.hit(black_box(key)));
        });
    }

    group.finish();
}

fn bench_membership_churn(c: &mut Criterion) {
    c.bench_function("ring_append_remove_16", |b| {
        let ring = build_ring(16);
        b.iter(|| {
            let _ = ring.append(black_box(Hashed(12345)));
            ring.remove_hash(black_box(12345));
        });
    });
}

criterion_group!(benches, bench_hit, bench_membership_churn);
criterion_main!(benches);
