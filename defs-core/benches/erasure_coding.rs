//! Benchmarks for Reed-Solomon erasure coding
//!
//! Run with: cargo bench --package defs-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use defs_core::erasure::ErasureCoder;

/// Generate test data of specified size
fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Split plus parity computation at various sizes, 10 + 3 layout
fn bench_encode(c: &mut Criterion) {
    let coder = ErasureCoder::new(10, 3).unwrap();
    let mut group = c.benchmark_group("erasure_encode");

    for size in [
        1024 * 1024,      // 1 MB
        4 * 1024 * 1024,  // 4 MB
        16 * 1024 * 1024, // 16 MB
    ] {
        let data = generate_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("sequential", format!("{}MB", size / (1024 * 1024))),
            &data,
            |b, data| b.iter(|| coder.encode(&coder.split(black_box(data)))),
        );
        group.bench_with_input(
            BenchmarkId::new("parallel_split", format!("{}MB", size / (1024 * 1024))),
            &data,
            |b, data| b.iter(|| coder.encode(&coder.split_parallel(black_box(data)))),
        );
    }

    group.finish();
}

/// Reconstruction with up to `m` shards missing
fn bench_reconstruct(c: &mut Criterion) {
    let coder = ErasureCoder::new(10, 3).unwrap();
    let data = generate_data(8 * 1024 * 1024);
    let data_shards = coder.split(&data);
    let parity = coder.encode(&data_shards).unwrap();
    let all: Vec<Vec<u8>> = data_shards.into_iter().chain(parity).collect();

    let mut group = c.benchmark_group("erasure_reconstruct");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for missing in [0usize, 1, 3] {
        group.bench_with_input(
            BenchmarkId::new("missing", missing),
            &missing,
            |b, &missing| {
                b.iter(|| {
                    let mut shards: Vec<Option<Vec<u8>>> = all.iter().cloned().map(Some).collect();
                    for slot in shards.iter_mut().take(missing) {
                        *slot = None;
                    }
                    coder.reconstruct(black_box(&mut shards)).unwrap();
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_reconstruct);
criterion_main!(benches);
