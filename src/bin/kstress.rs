//! Concurrency stress driver for the buffer cache and page allocator.
//!
//! Worker threads are placed on simulated cores and hammer both subsystems
//! at once, checking payloads as they go:
//! - `kalloc`: each worker allocates batches of pages, stamps them, checks
//!   the stamps survived, and frees them again
//! - `bcache`: each worker does read-modify-write cycles on a small shared
//!   set of blocks; every block carries a counter that must end up equal to
//!   the number of updates made to it
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --features stress --bin kstress -- --threads 8
//! cargo run --release --features stress --bin kstress -- --test bcache -v
//! ```

use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kcore::memory::AllocatorConfig;
use kcore::storage::{BlockDevice, BufferCache, CacheConfig, MemDisk};
use kcore::{cpu, KernelError, PageAllocator, Result, PAGE_SIZE};

const DEV: u32 = 1;

/// Which subsystem to stress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Test {
    All,
    Kalloc,
    Bcache,
}

/// kcore stress driver
#[derive(Parser, Debug)]
#[command(name = "kstress", version, about = "Stress the buffer cache and page allocator")]
struct Args {
    /// Subsystem to exercise
    #[arg(short, long, value_enum, default_value_t = Test::All)]
    test: Test,

    /// Worker threads, one per simulated core
    #[arg(short = 'j', long, default_value_t = 4)]
    threads: usize,

    /// Iterations per worker
    #[arg(short = 'n', long, default_value_t = 10_000)]
    iterations: u64,

    /// Buffers in the cache
    #[arg(long, default_value_t = kcore::storage::buffer_cache::NBUF)]
    nbuf: usize,

    /// Buckets in the cache
    #[arg(long, default_value_t = kcore::storage::buffer_cache::NBUCKET)]
    nbucket: usize,

    /// Distinct blocks the workers share
    #[arg(long, default_value_t = 64)]
    blocks: u32,

    /// Simulated disk latency per transfer, in microseconds
    #[arg(long, default_value_t = 0)]
    latency_us: u64,

    /// Pages managed by the allocator
    #[arg(long, default_value_t = 1024)]
    pages: usize,

    /// Pages a worker holds at once
    #[arg(long, default_value_t = 8)]
    batch: usize,

    /// Random seed
    #[arg(long, default_value_t = 0x6b63_6f72)]
    seed: u64,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "KSTRESS_LOG_LEVEL")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "kstress: setup failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_new(format!("kstress={level},kcore={level}"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

fn run(args: &Args) -> Result<bool> {
    if args.threads == 0 {
        return Err(KernelError::ConfigError("threads must be greater than 0".into()));
    }
    let mut ok = true;
    if matches!(args.test, Test::All | Test::Kalloc) {
        ok &= kalloc_test(args)?;
    }
    if matches!(args.test, Test::All | Test::Bcache) {
        ok &= bcache_test(args)?;
    }
    Ok(ok)
}

fn kalloc_test(args: &Args) -> Result<bool> {
    let kmem = PageAllocator::new(&AllocatorConfig::with_pages(args.threads, args.pages))?;
    let bad = AtomicU64::new(0);
    let start = Instant::now();

    thread::scope(|s| {
        for core in 0..args.threads {
            let (kmem, bad) = (&kmem, &bad);
            s.spawn(move || {
                cpu::set_current_core(core);
                let stamp = core as u8 + 0x10;
                let mut held = Vec::with_capacity(args.batch);
                for _ in 0..args.iterations {
                    while held.len() < args.batch {
                        let Some(mut page) = kmem.alloc() else {
                            break;
                        };
                        page.as_mut_slice().fill(stamp);
                        held.push(page);
                    }
                    for page in held.drain(..) {
                        if page.as_slice().iter().any(|&b| b != stamp) {
                            bad.fetch_add(1, Ordering::Relaxed);
                        }
                        kmem.free(page);
                    }
                }
            });
        }
    });

    let stats = kmem.stats();
    let bad = bad.into_inner();
    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        allocs = stats.allocs,
        frees = stats.frees,
        steals = stats.steals,
        failures = stats.failures,
        "kalloctest: done"
    );

    let conserved = kmem.free_pages() == kmem.total_pages();
    if !conserved {
        error!(
            free = kmem.free_pages(),
            total = kmem.total_pages(),
            "kalloctest: pages lost"
        );
    }
    if bad > 0 {
        error!(pages = bad, page_size = PAGE_SIZE, "kalloctest: corrupted pages");
    }
    let ok = conserved && bad == 0;
    println!("kalloctest: {}", if ok { "OK" } else { "FAIL" });
    Ok(ok)
}

fn bcache_test(args: &Args) -> Result<bool> {
    if args.blocks == 0 {
        return Err(KernelError::ConfigError("blocks must be greater than 0".into()));
    }
    // Every worker holds one buffer at a time and a lookup may need one more.
    if args.nbuf <= args.threads {
        return Err(KernelError::ConfigError(format!(
            "nbuf ({}) must exceed threads ({})",
            args.nbuf, args.threads
        )));
    }

    let disk = if args.latency_us > 0 {
        MemDisk::with_latency(Duration::from_micros(args.latency_us))
    } else {
        MemDisk::new()
    };
    let disk = Arc::new(disk);
    let config = CacheConfig::default()
        .with_nbuf(args.nbuf)
        .with_nbucket(args.nbucket);
    let cache = BufferCache::new(config, Arc::clone(&disk) as Arc<dyn BlockDevice>)?;
    let updates: Vec<AtomicU64> = (0..args.blocks).map(|_| AtomicU64::new(0)).collect();
    let start = Instant::now();

    thread::scope(|s| {
        for core in 0..args.threads {
            let (cache, updates) = (&cache, &updates);
            s.spawn(move || {
                cpu::set_current_core(core);
                let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(core as u64));
                for _ in 0..args.iterations {
                    let blockno = rng.gen_range(0..args.blocks);
                    let mut buf = cache.read(DEV, blockno);
                    let data = buf.data_mut();
                    let count = u64::from_le_bytes(read8(data, 4)) + 1;
                    data[0..4].copy_from_slice(&blockno.to_le_bytes());
                    data[4..12].copy_from_slice(&count.to_le_bytes());
                    cache.write(&mut buf);
                    cache.release(buf);
                    updates[blockno as usize].fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    let mut ok = true;
    for (blockno, expected) in (0..args.blocks).zip(&updates) {
        let expected = expected.load(Ordering::Relaxed);
        let buf = cache.read(DEV, blockno);
        let data = buf.data();
        let tag = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let count = u64::from_le_bytes(read8(data, 4));
        if expected > 0 && (tag != blockno || count != expected) {
            error!(blockno, tag, count, expected, "bcachetest: block mismatch");
            ok = false;
        }
    }

    let stats = cache.stats();
    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        hits = stats.hits,
        misses = stats.misses,
        steals = stats.steals,
        disk_reads = stats.disk_reads,
        disk_writes = stats.disk_writes,
        hit_rate = stats.hit_rate().unwrap_or(0.0),
        "bcachetest: done"
    );
    println!("bcachetest: {}", if ok { "OK" } else { "FAIL" });
    Ok(ok)
}

fn read8(data: &[u8], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&data[at..at + 8]);
    out
}
