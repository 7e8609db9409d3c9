use anyhow::ensure;
use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::mem;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use crate::allocators::bits::*;
use crate::allocators::*;

//-------------------------------------

/// A source of raw memory blocks.
pub trait ByteAllocator {
    /// Returns a block of `nr_bytes`, or None if memory is exhausted.
    fn alloc(&mut self, nr_bytes: u64) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc` on this allocator with the
    /// same `nr_bytes`, and not freed since.
    unsafe fn free(&mut self, ptr: NonNull<u8>, nr_bytes: u64);
}

/// `ByteAllocator` over the global Rust allocator.
pub struct SystemBytes {
    align: usize,
}

impl Default for SystemBytes {
    fn default() -> Self {
        Self { align: 16 }
    }
}

impl SystemBytes {
    pub fn new(align: usize) -> Result<Self> {
        if !align.is_power_of_two() {
            return Err(MemErr::BadParams(format!(
                "alignment {} is not a power of two",
                align
            )));
        }
        Ok(Self { align })
    }

    fn layout(&self, nr_bytes: u64) -> Option<Layout> {
        let size = usize::try_from(nr_bytes).ok().filter(|&s| s > 0)?;
        Layout::from_size_align(size, self.align).ok()
    }
}

impl ByteAllocator for SystemBytes {
    fn alloc(&mut self, nr_bytes: u64) -> Option<NonNull<u8>> {
        let layout = self.layout(nr_bytes)?;
        // SAFETY: layout has a non zero size.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, nr_bytes: u64) {
        if let Some(layout) = self.layout(nr_bytes) {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

//-------------------------------------

/// A pointer handed out by a `BlockPool`.
///
/// Besides the pointer it carries the allocation's position in the pool's
/// key space, which is what the pool indexes free extents by.  Blocks are
/// laid out in that space with a gap between them, so extents from
/// different blocks never coalesce even when the byte allocator returns
/// adjacent memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockPtr {
    ptr: NonNull<u8>,
    key: u64,
}

impl BlockPtr {
    pub fn as_ptr(self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_non_null(self) -> NonNull<u8> {
        self.ptr
    }

    pub fn key(self) -> u64 {
        self.key
    }
}

impl From<BlockPtr> for u64 {
    fn from(p: BlockPtr) -> u64 {
        p.key
    }
}

//-------------------------------------

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Growth granularity.  Must be a power of two.
    pub block_bytes: u64,

    /// Upper bound on the bytes the pool will request in total.
    pub max_bytes: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_bytes: 1 << 20,
            max_bytes: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Block {
    ptr: NonNull<u8>,
    len: u64,
}

/// Allocates variable sized pieces of memory out of large blocks obtained
/// from a `ByteAllocator`.
///
/// The pool owns every block it obtains and returns them all on `clear` or
/// drop, whether or not the pieces carved from them have been freed.
pub struct BlockPool {
    config: PoolConfig,
    bytes: Arc<Mutex<dyn ByteAllocator>>,
    free: FreeExtentIndex<u64>,

    // keyed by the block's base key
    blocks: BTreeMap<u64, Block>,
    next_key: u64,
    allocated_bytes: u64,
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        self.clear();
    }
}

impl BlockPool {
    pub fn new(bytes: Arc<Mutex<dyn ByteAllocator>>, config: PoolConfig) -> Result<Self> {
        if !config.block_bytes.is_power_of_two() {
            return Err(MemErr::BadParams(format!(
                "block size {} is not a power of two",
                config.block_bytes
            )));
        }

        Ok(Self {
            config,
            bytes,
            free: FreeExtentIndex::new(),
            blocks: BTreeMap::new(),
            next_key: 0,
            allocated_bytes: 0,
        })
    }

    pub fn with_system(config: PoolConfig) -> Result<Self> {
        Self::new(Arc::new(Mutex::new(SystemBytes::default())), config)
    }

    fn block_containing(&self, key: u64) -> Option<(u64, Block)> {
        let (&base, &block) = self.blocks.range(..=key).next_back()?;
        if key < base + block.len {
            Some((base, block))
        } else {
            None
        }
    }

    fn resolve(&self, key: u64) -> Result<BlockPtr> {
        let (base, block) = self.block_containing(key).ok_or(MemErr::BadFree(key))?;
        let p = block.ptr.as_ptr().wrapping_add((key - base) as usize);
        let ptr = NonNull::new(p).ok_or(MemErr::BadFree(key))?;
        Ok(BlockPtr { ptr, key })
    }

    fn new_block(&mut self, bytes_needed: u64) -> Result<BlockPtr> {
        let len = align_up(bytes_needed, self.config.block_bytes).ok_or(MemErr::OutOfSpace)?;
        if let Some(max) = self.config.max_bytes {
            match self.allocated_bytes.checked_add(len) {
                Some(total) if total <= max => {}
                _ => {
                    debug!(len, allocated = self.allocated_bytes, max, "pool limit reached");
                    return Err(MemErr::OutOfSpace);
                }
            }
        }

        let ptr = match lock(&self.bytes).alloc(len) {
            Some(ptr) => ptr,
            None => {
                debug!(len, "byte allocator exhausted");
                return Err(MemErr::OutOfSpace);
            }
        };

        let key = self.next_key;
        self.next_key = key + len + 1;
        self.blocks.insert(key, Block { ptr, len });
        self.allocated_bytes += len;
        debug!(len, key, total = self.allocated_bytes, "new block");

        if len > bytes_needed {
            self.free.insert(key + bytes_needed, len - bytes_needed)?;
        }
        Ok(BlockPtr { ptr, key })
    }

    pub fn alloc(&mut self, bytes_needed: u64) -> Result<BlockPtr> {
        if bytes_needed == 0 {
            return Err(MemErr::BadParams("cannot allocate zero bytes".to_string()));
        }

        match self.free.carve(bytes_needed) {
            Some(key) => {
                trace!(key, bytes_needed, "alloc from free set");
                self.resolve(key)
            }
            None => self.new_block(bytes_needed),
        }
    }

    /// Returns `bytes` starting at `p` to the pool.  `bytes` must be the
    /// length passed to `alloc`.
    pub fn free(&mut self, p: BlockPtr, bytes: u64) -> Result<()> {
        trace!(key = p.key, bytes, "free");
        match self.block_containing(p.key) {
            Some((base, block))
                if p.key.checked_add(bytes).map_or(false, |end| end <= base + block.len) =>
            {
                self.free.release(p.key, bytes)
            }
            _ => Err(MemErr::BadFree(p.key)),
        }
    }

    /// Returns every block to the byte allocator.  Pointers handed out
    /// before the call are left dangling.
    pub fn clear(&mut self) {
        if self.blocks.is_empty() {
            return;
        }
        debug!(nr_blocks = self.blocks.len(), bytes = self.allocated_bytes, "clearing pool");

        let mut bytes = lock(&self.bytes);
        for (_, block) in mem::take(&mut self.blocks) {
            // SAFETY: every block was obtained from this allocator with the
            // same length and is freed exactly once.
            unsafe { bytes.free(block.ptr, block.len) };
        }

        self.free.clear();
        self.next_key = 0;
        self.allocated_bytes = 0;
    }

    /// Total bytes obtained from the byte allocator since creation or the
    /// last `clear`.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn block_bytes(&self) -> u64 {
        self.config.block_bytes
    }

    pub fn nr_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.total()
    }

    pub fn nr_free_extents(&self) -> usize {
        self.free.len()
    }

    pub fn check(&self) -> anyhow::Result<()> {
        self.free.check()?;

        let total: u64 = self.blocks.values().map(|b| b.len).sum();
        ensure!(total == self.allocated_bytes);

        for (key, len) in self.free.iter() {
            let inside = matches!(
                self.block_containing(key),
                Some((base, block)) if key + len <= base + block.len
            );
            ensure!(inside, "free extent {}+{} is not inside a block", key, len);
        }
        Ok(())
    }
}

impl RangeAllocator for BlockPool {
    type Handle = BlockPtr;

    fn alloc(&mut self, len: u64) -> Result<BlockPtr> {
        BlockPool::alloc(self, len)
    }

    fn free(&mut self, handle: BlockPtr, len: u64) -> Result<()> {
        BlockPool::free(self, handle, len)
    }

    fn free_bytes(&self) -> u64 {
        BlockPool::free_bytes(self)
    }

    fn backed_bytes(&self) -> u64 {
        self.allocated_bytes()
    }

    fn check(&self) -> anyhow::Result<()> {
        BlockPool::check(self)
    }
}

//-------------------------------------


//-------------------------------------
