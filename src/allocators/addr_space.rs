use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use crate::allocators::*;

//-------------------------------------

/// An opaque address handed out by an `AddrSpaceAllocator`.  No memory backs
/// it; what the address means is up to the provider.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub u64);

impl ExtentKey for Addr {
    fn addr(self) -> u64 {
        self.0
    }

    fn offset(self, len: u64) -> Self {
        Addr(self.0 + len)
    }
}

impl From<Addr> for u64 {
    fn from(a: Addr) -> u64 {
        a.0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

//-------------------------------------

/// Allocates ranges of an abstract address space, growing it through a
/// chunk or region provider when the free set cannot satisfy a request.
pub struct AddrSpaceAllocator {
    backing: Backing,
    free: FreeExtentIndex<Addr>,
}

impl AddrSpaceAllocator {
    pub fn new(backing: Backing) -> Self {
        Self {
            backing,
            free: FreeExtentIndex::new(),
        }
    }

    pub fn with_chunks(provider: Arc<Mutex<dyn ChunkProvider>>) -> Self {
        Self::new(Backing::Chunk(provider))
    }

    pub fn with_region(provider: Arc<Mutex<dyn RegionProvider>>) -> Self {
        Self::new(Backing::Region(provider))
    }

    pub fn alloc(&mut self, size: u64) -> Result<Addr> {
        if size == 0 {
            return Err(MemErr::BadParams("cannot allocate zero length".to_string()));
        }

        if let Some(addr) = self.free.carve(size) {
            trace!(%addr, size, "alloc from free set");
            return Ok(addr);
        }

        match &self.backing {
            Backing::Chunk(p) => {
                let mut provider = lock(p);
                grow_by_chunk(&mut self.free, &mut *provider, size)
            }
            Backing::Region(p) => {
                let mut provider = lock(p);
                grow_by_region(&mut self.free, &mut *provider, size)
            }
        }
    }

    /// Returns `[addr, addr + size)` to the free set.  `size` must be the
    /// length passed to `alloc`.
    pub fn free(&mut self, addr: Addr, size: u64) -> Result<()> {
        trace!(%addr, size, "free");
        self.free.release(addr, size)
    }

    /// Total length obtained from the provider so far.
    pub fn backing_size(&self) -> u64 {
        self.backing.allocated_size()
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.total()
    }

    pub fn nr_free_extents(&self) -> usize {
        self.free.len()
    }

    pub fn extents(&self) -> impl Iterator<Item = (Addr, u64)> + '_ {
        self.free.iter()
    }

    pub fn check(&self) -> anyhow::Result<()> {
        self.free.check()
    }
}

// If the highest free extent ends exactly at `end` it is removed from the
// index and returned.
fn take_tail(free: &mut FreeExtentIndex<Addr>, end: Addr) -> Option<(Addr, u64)> {
    match free.max_address_extent() {
        Some((start, len)) if start.offset(len) == end => {
            free.remove_exact(start);
            Some((start, len))
        }
        _ => None,
    }
}

fn grow_by_chunk(
    free: &mut FreeExtentIndex<Addr>,
    provider: &mut dyn ChunkProvider,
    size: u64,
) -> Result<Addr> {
    let (start, granted) = match provider.alloc(size) {
        Some((start, granted)) => (Addr(start), granted),
        None => {
            debug!(size, "chunk provider exhausted");
            return Err(MemErr::OutOfSpace);
        }
    };
    debug!(%start, granted, size, "grew by chunk");

    if granted < size {
        // Short grant.  Keep what we were given so nothing leaks.
        if granted > 0 {
            free.release(start, granted)?;
        }
        return Err(MemErr::OutOfSpace);
    }

    // A chunk that continues the highest free extent is merged with it.
    let (start, total) = match take_tail(free, start) {
        Some((tail, tail_len)) => (tail, tail_len + granted),
        None => (start, granted),
    };

    if total > size {
        free.insert(start.offset(size), total - size)?;
    }
    Ok(start)
}

fn grow_by_region(
    free: &mut FreeExtentIndex<Addr>,
    provider: &mut dyn RegionProvider,
    size: u64,
) -> Result<Addr> {
    let end = Addr(provider.reserved_base() + provider.allocated_size());

    // An unused tail at the end of the region only needs topping up.
    let tail = take_tail(free, end);
    let (start, tail_len) = tail.unwrap_or((end, 0));
    let needed = size - tail_len;

    let extended = provider.extend(needed);
    if extended == 0 {
        debug!(size, needed, "region provider exhausted");
        if let Some((tail, tail_len)) = tail {
            free.insert(tail, tail_len)?;
        }
        return Err(MemErr::OutOfSpace);
    }
    debug!(%start, extended, size, "grew region");

    let total = tail_len + extended;
    if total < size {
        free.release(start, total)?;
        return Err(MemErr::OutOfSpace);
    }

    if total > size {
        free.insert(start.offset(size), total - size)?;
    }
    Ok(start)
}

impl RangeAllocator for AddrSpaceAllocator {
    type Handle = Addr;

    fn alloc(&mut self, len: u64) -> Result<Addr> {
        AddrSpaceAllocator::alloc(self, len)
    }

    fn free(&mut self, handle: Addr, len: u64) -> Result<()> {
        AddrSpaceAllocator::free(self, handle, len)
    }

    fn free_bytes(&self) -> u64 {
        AddrSpaceAllocator::free_bytes(self)
    }

    fn backed_bytes(&self) -> u64 {
        self.backing_size()
    }

    fn check(&self) -> anyhow::Result<()> {
        AddrSpaceAllocator::check(self)
    }
}

//-------------------------------------


//-------------------------------------
