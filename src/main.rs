use anyhow::{anyhow, Result};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use std::env;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use extent_alloc::allocators::*;

//-------------------------------------------------------------------------

#[derive(Default)]
struct Stats {
    nr_allocs: u64,
    nr_frees: u64,
    nr_failed: u64,
    peak_outstanding: u64,
}

fn stress<A: RangeAllocator>(alloc: &mut A, nr_ops: usize, seed: u64) -> Result<Stats> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut live: Vec<(A::Handle, u64)> = Vec::new();
    let mut outstanding = 0;
    let mut stats = Stats::default();

    for i in 0..nr_ops {
        if live.is_empty() || rng.gen_bool(0.55) {
            // mostly small, the occasional large one
            let len = if rng.gen_bool(0.05) {
                rng.gen_range(4096..=1 << 20)
            } else {
                rng.gen_range(1..=4096)
            };

            match alloc.alloc(len) {
                Ok(h) => {
                    live.push((h, len));
                    outstanding += len;
                    stats.nr_allocs += 1;
                    stats.peak_outstanding = stats.peak_outstanding.max(outstanding);
                }
                Err(MemErr::OutOfSpace) => stats.nr_failed += 1,
                Err(e) => return Err(e.into()),
            }
        } else {
            let idx = rng.gen_range(0..live.len());
            let (h, len) = live.swap_remove(idx);
            alloc.free(h, len)?;
            outstanding -= len;
            stats.nr_frees += 1;
        }

        if i % 10_000 == 0 {
            alloc.check()?;
            info!(
                op = i,
                outstanding,
                free = alloc.free_bytes(),
                backed = alloc.backed_bytes(),
                "progress"
            );
        }
    }

    for (h, len) in live.drain(..) {
        alloc.free(h, len)?;
    }
    alloc.check()?;

    Ok(stats)
}

fn report<A: RangeAllocator>(name: &str, alloc: &A, stats: &Stats) {
    println!("allocator:        {}", name);
    println!("allocs:           {}", stats.nr_allocs);
    println!("frees:            {}", stats.nr_frees);
    println!("failed allocs:    {}", stats.nr_failed);
    println!("peak outstanding: {}", stats.peak_outstanding);
    println!("backed bytes:     {}", alloc.backed_bytes());
    println!("free bytes:       {}", alloc.free_bytes());
}

fn run(mode: &str, nr_ops: usize, seed: u64) -> Result<()> {
    const GIB: u64 = 1 << 30;

    match mode {
        "chunk" => {
            let chunks = Arc::new(Mutex::new(BumpChunks::new(0x1000, 0x1000 + 64 * GIB, 64 * 1024)?));
            let mut alloc = AddrSpaceAllocator::with_chunks(chunks);
            let stats = stress(&mut alloc, nr_ops, seed)?;
            report(mode, &alloc, &stats);
            println!("free extents:     {}", alloc.nr_free_extents());
        }
        "region" => {
            let region = Arc::new(Mutex::new(FixedRegion::new(0x1_0000_0000, 64 * GIB, 64 * 1024)?));
            let mut alloc = AddrSpaceAllocator::with_region(region);
            let stats = stress(&mut alloc, nr_ops, seed)?;
            report(mode, &alloc, &stats);
            println!("free extents:     {}", alloc.nr_free_extents());
        }
        "pool" => {
            let mut pool = BlockPool::with_system(PoolConfig {
                max_bytes: Some(GIB),
                ..Default::default()
            })?;
            let stats = stress(&mut pool, nr_ops, seed)?;
            report(mode, &pool, &stats);
            println!("blocks:           {}", pool.nr_blocks());
        }
        _ => return Err(anyhow!("unknown allocator '{}'", mode)),
    }

    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args.len() > 5 {
        eprintln!("Usage: {} <chunk|region|pool> [nr_ops] [seed] [log-level]", args[0]);
        std::process::exit(1);
    }

    let nr_ops = args.get(2).map(|s| s.parse::<usize>()).transpose()?.unwrap_or(100_000);
    let seed = args.get(3).map(|s| s.parse::<u64>()).transpose()?.unwrap_or(0);
    let level = args
        .get(4)
        .map(|s| Level::from_str(s))
        .transpose()?
        .unwrap_or(Level::INFO);

    // Set up tracing
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    run(&args[1], nr_ops, seed)
}

//-------------------------------------------------------------------------
