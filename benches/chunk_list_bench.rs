//! Benchmarks for the pooled allocator and reference churn
//!
//! Measures:
//! - Insert/remove churn in MemoryChunkList vs. Box allocation
//! - Chunk growth and reclamation for large batches
//! - Reference create/delete through Env

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use jsvm_runtime::gc::{Env, Heap};
use jsvm_runtime::memory::MemoryChunkList;
use std::hint::black_box;

#[derive(Default)]
struct Payload {
    _words: [u64; 4],
}

/// Benchmark: one insert immediately followed by its remove (slot reuse)
fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");

    group.bench_function("chunk_list", |b| {
        let mut list: MemoryChunkList<Payload> = MemoryChunkList::new();
        b.iter(|| {
            let id = list.insert(Payload::default());
            black_box(list.remove(id));
        });
    });

    group.bench_function("box", |b| {
        b.iter(|| {
            let boxed = Box::new(Payload::default());
            black_box(boxed);
        });
    });

    group.finish();
}

/// Benchmark: fill N slots, then free them all (grows and reclaims chunks)
fn bench_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch");

    for size in [8usize, 64, 1024] {
        group.bench_with_input(BenchmarkId::new("chunk_list", size), &size, |b, &size| {
            let mut list: MemoryChunkList<Payload> = MemoryChunkList::new();
            let mut ids = Vec::with_capacity(size);
            b.iter(|| {
                ids.extend((0..size).map(|_| list.insert(Payload::default())));
                for id in ids.drain(..) {
                    black_box(list.remove(id));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: user reference lifecycle against the reference heap
fn bench_references(c: &mut Criterion) {
    c.bench_function("reference_create_delete", |b| {
        let mut env: Env<Heap> = Env::default();
        b.iter(|| {
            env.handle_scope(|env| {
                let obj = env.engine_mut().new_object();
                let id = env.create_reference(&obj, 1);
                black_box(env.reference_ref(id).ok());
                env.delete_reference(id).ok();
            });
        });
    });
}

criterion_group!(benches, bench_churn, bench_batches, bench_references);
criterion_main!(benches);
