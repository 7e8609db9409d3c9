use anyhow::{ensure, Result};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use test_log::test;

use crate::allocators::*;

//-------------------------------------------------------------------------

// Live allocations keyed by address.
type Live<H> = BTreeMap<u64, (H, u64)>;

fn check_disjoint<H>(live: &Live<H>, addr: u64, len: u64) -> Result<()> {
    if let Some((&s, &(_, l))) = live.range(..=addr).next_back() {
        ensure!(s + l <= addr, "{:#x}+{} overlaps live {:#x}+{}", addr, len, s, l);
    }
    if let Some((&s, _)) = live.range(addr..).next() {
        ensure!(addr + len <= s, "{:#x}+{} overlaps live {:#x}", addr, len, s);
    }
    Ok(())
}

fn check_conservation<A: RangeAllocator>(alloc: &A, live: &Live<A::Handle>) -> Result<()> {
    let outstanding: u64 = live.values().map(|&(_, l)| l).sum();
    ensure!(
        alloc.free_bytes() + outstanding == alloc.backed_bytes(),
        "free {} + outstanding {} != backed {}",
        alloc.free_bytes(),
        outstanding,
        alloc.backed_bytes()
    );
    Ok(())
}

/// Runs a random mix of allocs and frees, checking the allocator after every
/// step.  Returns the number of allocations that failed for lack of space.
fn random_workload<A: RangeAllocator>(
    alloc: &mut A,
    seed: u64,
    nr_ops: usize,
    max_len: u64,
) -> Result<usize> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut live: Live<A::Handle> = BTreeMap::new();
    let mut nr_failed = 0;

    for i in 0..nr_ops {
        if live.is_empty() || rng.gen_bool(0.6) {
            let len = rng.gen_range(1..=max_len);
            let free_before = alloc.free_bytes();
            let backed_before = alloc.backed_bytes();

            match alloc.alloc(len) {
                Ok(h) => {
                    let addr: u64 = h.into();
                    check_disjoint(&live, addr, len)?;
                    live.insert(addr, (h, len));
                }
                Err(MemErr::OutOfSpace) => {
                    ensure!(alloc.free_bytes() == free_before);
                    ensure!(alloc.backed_bytes() == backed_before);
                    nr_failed += 1;
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            let idx = rng.gen_range(0..live.len());
            let addr = *live.keys().nth(idx).unwrap();
            let (h, len) = live.remove(&addr).unwrap();
            alloc.free(h, len)?;
        }

        check_conservation(alloc, &live)?;
        if i % 64 == 0 {
            alloc.check()?;
        }
    }

    for (_, (h, len)) in live {
        alloc.free(h, len)?;
    }
    alloc.check()?;
    ensure!(alloc.free_bytes() == alloc.backed_bytes());

    Ok(nr_failed)
}

//-------------------------------------------------------------------------

#[test]
fn random_contiguous_chunks() -> Result<()> {
    for seed in 0..4 {
        let chunks = Arc::new(Mutex::new(BumpChunks::new(0x1000, 1 << 40, 4096)?));
        let mut alloc = AddrSpaceAllocator::with_chunks(chunks);
        let nr_failed = random_workload(&mut alloc, seed, 2000, 5000)?;
        ensure!(nr_failed == 0);

        // every chunk was contiguous with the last, so it all folds back up
        ensure!(alloc.nr_free_extents() == 1);
    }
    Ok(())
}

#[test]
fn random_gapped_chunks() -> Result<()> {
    for seed in 0..4 {
        let chunks = Arc::new(Mutex::new(BumpChunks::new(0, 1 << 40, 4096)?.with_gap(1)));
        let mut alloc = AddrSpaceAllocator::with_chunks(chunks);
        random_workload(&mut alloc, seed, 2000, 5000)?;
    }
    Ok(())
}

#[test]
fn random_region() -> Result<()> {
    for seed in 0..4 {
        let region = Arc::new(Mutex::new(FixedRegion::new(0x1000_0000, 1 << 40, 4096)?));
        let mut alloc = AddrSpaceAllocator::with_region(region.clone());
        let nr_failed = random_workload(&mut alloc, seed, 2000, 5000)?;
        ensure!(nr_failed == 0);

        let extents: Vec<_> = alloc.extents().collect();
        ensure!(extents == vec![(Addr(0x1000_0000), alloc.backing_size())]);
    }
    Ok(())
}

#[test]
fn random_region_exhaustion() -> Result<()> {
    for seed in 0..4 {
        let region = Arc::new(Mutex::new(FixedRegion::new(0, 64 * 1024, 1024)?));
        let mut alloc = AddrSpaceAllocator::with_region(region);
        let nr_failed = random_workload(&mut alloc, seed, 2000, 3000)?;
        ensure!(nr_failed > 0);
        ensure!(alloc.nr_free_extents() == 1);
    }
    Ok(())
}

#[test]
fn random_chunk_exhaustion() -> Result<()> {
    for seed in 0..4 {
        let chunks = Arc::new(Mutex::new(BumpChunks::new(0, 64 * 1024, 1024)?));
        let mut alloc = AddrSpaceAllocator::with_chunks(chunks);
        let nr_failed = random_workload(&mut alloc, seed, 2000, 3000)?;
        ensure!(nr_failed > 0);
    }
    Ok(())
}

#[test]
fn random_pool() -> Result<()> {
    for seed in 0..4 {
        let config = PoolConfig {
            block_bytes: 64 * 1024,
            ..Default::default()
        };
        let mut pool = BlockPool::with_system(config)?;
        let nr_failed = random_workload(&mut pool, seed, 2000, 20000)?;
        ensure!(nr_failed == 0);

        // one extent per block, nothing merges across blocks
        ensure!(pool.nr_free_extents() == pool.nr_blocks());
    }
    Ok(())
}

#[test]
fn random_pool_with_limit() -> Result<()> {
    for seed in 0..4 {
        let config = PoolConfig {
            block_bytes: 4096,
            max_bytes: Some(256 * 1024),
        };
        let mut pool = BlockPool::with_system(config)?;
        let nr_failed = random_workload(&mut pool, seed, 2000, 10000)?;
        ensure!(nr_failed > 0);
        ensure!(pool.allocated_bytes() <= 256 * 1024);
    }
    Ok(())
}

#[test]
fn same_sequence_same_addresses() -> Result<()> {
    let mk = || -> Result<AddrSpaceAllocator> {
        let region = Arc::new(Mutex::new(FixedRegion::new(0, 1 << 30, 512)?));
        Ok(AddrSpaceAllocator::with_region(region))
    };

    let mut a1 = mk()?;
    let mut a2 = mk()?;
    let mut rng = ChaCha20Rng::seed_from_u64(42);
    let mut live = Vec::new();
    for _ in 0..500 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let len = rng.gen_range(1..1000);
            let x = a1.alloc(len)?;
            let y = a2.alloc(len)?;
            ensure!(x == y);
            live.push((x, len));
        } else {
            let idx = rng.gen_range(0..live.len());
            let (addr, len) = live.swap_remove(idx);
            a1.free(addr, len)?;
            a2.free(addr, len)?;
        }
    }
    Ok(())
}

//-------------------------------------------------------------------------
