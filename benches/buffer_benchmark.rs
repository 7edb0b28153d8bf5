//! Buffer cache benchmarks.
//!
//! Measures buffer cache performance for:
//! - Cache hits on a resident working set
//! - Random access with recycling
//! - Write-through
//! - Cross-bucket stealing under skewed load
//! - Contended lookups from several threads

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kcore::storage::{BlockDevice, BufferCache, CacheConfig, MemDisk};
use kcore::BLOCK_SIZE;

fn create_cache(nbuf: usize, nbucket: usize) -> BufferCache {
    let disk: Arc<dyn BlockDevice> = Arc::new(MemDisk::new());
    let config = CacheConfig::default().with_nbuf(nbuf).with_nbucket(nbucket);
    BufferCache::new(config, disk).expect("create cache")
}

/// Benchmark repeated reads of cached blocks (cache hits)
fn bench_sequential_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("bcache_sequential");

    let cache = create_cache(30, 13);
    // Warm the cache
    for blockno in 0..26 {
        drop(cache.read(1, blockno));
    }

    group.throughput(Throughput::Elements(26));
    group.bench_function("26_blocks_resident", |b| {
        b.iter(|| {
            for blockno in 0..26 {
                let buf = cache.read(1, blockno);
                black_box(buf.data()[0]);
            }
        });
    });

    group.finish();
}

/// Benchmark random block access
fn bench_random_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("bcache_random");

    let cache = create_cache(30, 13);

    // Generate pseudo-random access pattern
    let mut access_pattern = Vec::new();
    let mut seed: u32 = 12345;
    for _ in 0..1000 {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
        access_pattern.push(seed % 100);
    }

    group.throughput(Throughput::Elements(1000));
    group.bench_function("1000_random_reads", |b| {
        b.iter(|| {
            for &blockno in &access_pattern {
                let buf = cache.read(1, blockno);
                black_box(buf.data()[0]);
            }
        });
    });

    group.finish();
}

/// Benchmark write-through
fn bench_block_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("bcache_write");

    let cache = create_cache(30, 13);

    group.throughput(Throughput::Bytes(BLOCK_SIZE as u64 * 20));
    group.bench_function("20_blocks_write", |b| {
        b.iter(|| {
            for blockno in 0..20 {
                let mut buf = cache.read(1, blockno);
                buf.data_mut().fill(0x42);
                cache.write(&mut buf);
            }
        });
    });

    group.finish();
}

/// Benchmark lookups that keep one bucket hot, forcing steals
fn bench_steal_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("bcache_steal");

    let nbucket = 13;
    let cache = create_cache(30, nbucket);
    // Every block hashes to bucket 0
    let blocks: Vec<u32> = (0..40).map(|i| i * nbucket as u32).collect();

    group.throughput(Throughput::Elements(blocks.len() as u64));
    group.bench_function("single_bucket_skew", |b| {
        b.iter(|| {
            for &blockno in &blocks {
                let buf = cache.read(1, blockno);
                black_box(buf.data()[0]);
            }
        });
    });

    group.finish();
}

/// Benchmark concurrent lookups with different bucket counts
fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("bcache_contention");

    const THREADS: u32 = 4;
    const READS: u32 = 500;

    for nbucket in &[1usize, 4, 13] {
        let cache = create_cache(30, *nbucket);

        group.throughput(Throughput::Elements(u64::from(THREADS * READS)));
        group.bench_with_input(BenchmarkId::from_parameter(nbucket), nbucket, |b, _| {
            b.iter(|| {
                thread::scope(|s| {
                    for t in 0..THREADS {
                        let cache = &cache;
                        s.spawn(move || {
                            for i in 0..READS {
                                let buf = cache.read(1, (t * 7 + i) % 24);
                                black_box(buf.data()[0]);
                            }
                        });
                    }
                });
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sequential_hits,
    bench_random_access,
    bench_block_write,
    bench_steal_pressure,
    bench_contention
);
criterion_main!(benches);
