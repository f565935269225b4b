use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use logstore::stdx::PriorityQueue;

const SIZES: [usize; 3] = [64, 1024, 16_384];

/// Deterministic pseudo-random priorities; no rng dependency needed.
fn priority(seed: u64) -> usize {
    let mut x = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
    x ^= x >> 31;
    (x % 4096) as usize
}

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_pqueue/push_pop");
    for size in SIZES {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut pq = PriorityQueue::new();
                for extent in 0..size as u64 {
                    pq.push(extent, priority(extent));
                }
                while let Some(extent) = pq.pop() {
                    black_box(extent);
                }
            });
        });
    }
    group.finish();
}

fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_pqueue/update");
    for size in SIZES {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut pq = PriorityQueue::new();
            for extent in 0..size as u64 {
                pq.push(extent, priority(extent));
            }
            let mut round = 0u64;
            b.iter(|| {
                round += 1;
                // Every extent's garbage count changes, as a heavy
                // mark_garbage storm would cause.
                for extent in 0..size as u64 {
                    pq.update(extent, priority(extent.wrapping_add(round)));
                }
                black_box(pq.peek());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_update);
criterion_main!(benches);
