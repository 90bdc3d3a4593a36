//! Topic matching benchmarks.
//!
//! Measures trie lookups and subscriber resolution as the number of
//! filters grows.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use roost_bench::{fleet_filters, populated_registry, populated_trie};

const SIZES: [usize; 3] = [100, 1_000, 10_000];

/// Benchmark collecting every filter that matches a topic.
fn bench_match_many(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_match_many");

    for size in SIZES {
        let trie = populated_trie(&fleet_filters(size));
        let topic = ["site", "3", "dev", "35", "power"];
        group.bench_with_input(BenchmarkId::from_parameter(size), &trie, |b, trie| {
            b.iter(|| trie.match_many(black_box(&topic)))
        });
    }

    group.finish();
}

/// Benchmark single-match lookup as used for ACL checks.
fn bench_match_one(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_match_one");

    for size in SIZES {
        let trie = populated_trie(&fleet_filters(size));
        let topic = ["site", "3", "dev", "35", "power"];
        group.bench_with_input(BenchmarkId::from_parameter(size), &trie, |b, trie| {
            b.iter(|| trie.match_one(black_box(&topic)))
        });
    }

    group.finish();
}

/// Benchmark resolving the subscribers of a published topic.
fn bench_get_subscribers(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_get_subscribers");

    for size in SIZES {
        let registry = populated_registry(&fleet_filters(size), 64);
        group.bench_with_input(BenchmarkId::from_parameter(size), &registry, |b, registry| {
            b.iter(|| registry.get_subscribers(black_box("site/3/dev/35/power")))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_match_many,
    bench_match_one,
    bench_get_subscribers
);
criterion_main!(benches);
