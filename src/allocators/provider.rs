use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::allocators::bits::*;
use crate::allocators::*;

//-------------------------------------

/// A source of address ranges that may be placed anywhere.
pub trait ChunkProvider {
    fn allocated_size(&self) -> u64;

    /// Returns the start and length of a new range at least `needed` long,
    /// or None if the provider is exhausted.
    fn alloc(&mut self, needed: u64) -> Option<(u64, u64)>;
}

/// A single contiguous region with a fixed base that only grows at its end.
pub trait RegionProvider {
    fn reserved_base(&self) -> u64;
    fn allocated_size(&self) -> u64;

    /// Appends at least `needed` to the end of the region and returns the
    /// amount actually added, or 0 on failure.
    fn extend(&mut self, needed: u64) -> u64;
}

/// The growth strategy of an address space allocator, fixed at construction.
#[derive(Clone)]
pub enum Backing {
    Chunk(Arc<Mutex<dyn ChunkProvider>>),
    Region(Arc<Mutex<dyn RegionProvider>>),
}

impl Backing {
    pub fn allocated_size(&self) -> u64 {
        match self {
            Backing::Chunk(p) => lock(p).allocated_size(),
            Backing::Region(p) => lock(p).allocated_size(),
        }
    }
}

//-------------------------------------

/// Hands out chunks from the window `[base, limit)` in ascending order.
///
/// Grants are rounded up to `chunk_size`.  A non zero `gap` leaves a hole
/// after every grant, so consecutive chunks are never contiguous.
pub struct BumpChunks {
    next: u64,
    limit: u64,
    chunk_size: u64,
    gap: u64,
    allocated: u64,
}

impl BumpChunks {
    pub fn new(base: u64, limit: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(MemErr::BadParams("chunk size must be non zero".to_string()));
        }
        if limit < base {
            return Err(MemErr::BadParams("limit below base".to_string()));
        }

        Ok(Self {
            next: base,
            limit,
            chunk_size,
            gap: 0,
            allocated: 0,
        })
    }

    pub fn with_gap(mut self, gap: u64) -> Self {
        self.gap = gap;
        self
    }
}

impl ChunkProvider for BumpChunks {
    fn allocated_size(&self) -> u64 {
        self.allocated
    }

    fn alloc(&mut self, needed: u64) -> Option<(u64, u64)> {
        let size = round_up(needed, self.chunk_size)?;
        let start = self.next;
        let end = start.checked_add(size)?;
        if end > self.limit {
            debug!(needed, start, limit = self.limit, "chunk window exhausted");
            return None;
        }

        self.next = end.saturating_add(self.gap);
        self.allocated += size;
        Some((start, size))
    }
}

//-------------------------------------

/// A reserved window `[base, base + reserved)` that is committed from the
/// bottom up in multiples of `granularity`.  Requests that would overrun the
/// reservation fail outright; partial grants are never made.
pub struct FixedRegion {
    base: u64,
    reserved: u64,
    allocated: u64,
    granularity: u64,
}

impl FixedRegion {
    pub fn new(base: u64, reserved: u64, granularity: u64) -> Result<Self> {
        if granularity == 0 {
            return Err(MemErr::BadParams("granularity must be non zero".to_string()));
        }
        if base.checked_add(reserved).is_none() {
            return Err(MemErr::BadParams("reservation wraps the address space".to_string()));
        }

        Ok(Self {
            base,
            reserved,
            allocated: 0,
            granularity,
        })
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }
}

impl RegionProvider for FixedRegion {
    fn reserved_base(&self) -> u64 {
        self.base
    }

    fn allocated_size(&self) -> u64 {
        self.allocated
    }

    fn extend(&mut self, needed: u64) -> u64 {
        let grant = match round_up(needed, self.granularity) {
            Some(g) => g,
            None => return 0,
        };

        match self.allocated.checked_add(grant) {
            Some(total) if total <= self.reserved => {
                self.allocated = total;
                grant
            }
            _ => {
                debug!(needed, allocated = self.allocated, reserved = self.reserved, "region exhausted");
                0
            }
        }
    }
}

//-------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_chunks_rounds_up() -> Result<()> {
        let mut chunks = BumpChunks::new(4096, 4096 + 1024, 256)?;
        assert_eq!(chunks.alloc(1), Some((4096, 256)));
        assert_eq!(chunks.alloc(256), Some((4096 + 256, 256)));
        assert_eq!(chunks.alloc(300), Some((4096 + 512, 512)));
        assert_eq!(chunks.allocated_size(), 1024);
        assert_eq!(chunks.alloc(1), None);
        assert_eq!(chunks.allocated_size(), 1024);
        Ok(())
    }

    #[test]
    fn test_bump_chunks_gap() -> Result<()> {
        let mut chunks = BumpChunks::new(0, 1 << 20, 64)?.with_gap(64);
        assert_eq!(chunks.alloc(10), Some((0, 64)));
        assert_eq!(chunks.alloc(10), Some((128, 64)));
        assert_eq!(chunks.allocated_size(), 128);
        Ok(())
    }

    #[test]
    fn test_bump_chunks_bad_params() {
        assert!(BumpChunks::new(0, 100, 0).is_err());
        assert!(BumpChunks::new(100, 0, 16).is_err());
    }

    #[test]
    fn test_fixed_region_extend() -> Result<()> {
        let mut region = FixedRegion::new(0x10000, 4096, 1024)?;
        assert_eq!(region.reserved_base(), 0x10000);
        assert_eq!(region.extend(1), 1024);
        assert_eq!(region.extend(1025), 2048);
        assert_eq!(region.allocated_size(), 3072);

        // no partial grants
        assert_eq!(region.extend(2048), 0);
        assert_eq!(region.allocated_size(), 3072);

        assert_eq!(region.extend(1024), 1024);
        assert_eq!(region.allocated_size(), region.reserved());
        assert_eq!(region.extend(1), 0);
        Ok(())
    }

    #[test]
    fn test_backing_reports_provider_size() -> Result<()> {
        let region = Arc::new(Mutex::new(FixedRegion::new(0, 1 << 20, 4096)?));
        let backing = Backing::Region(region.clone());
        assert_eq!(backing.allocated_size(), 0);
        region.lock().unwrap().extend(1);
        assert_eq!(backing.allocated_size(), 4096);
        Ok(())
    }
}

//-------------------------------------
