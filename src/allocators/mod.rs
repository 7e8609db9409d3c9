mod bits;
pub mod addr_space;
pub mod block_pool;
pub mod extent_index;
pub mod provider;

#[cfg(test)]
mod tests;

//-------------------------------------

pub use crate::allocators::addr_space::{Addr, AddrSpaceAllocator};
pub use crate::allocators::block_pool::{BlockPool, BlockPtr, ByteAllocator, PoolConfig, SystemBytes};
pub use crate::allocators::extent_index::{ExtentKey, FreeExtentIndex};
pub use crate::allocators::provider::{Backing, BumpChunks, ChunkProvider, FixedRegion, RegionProvider};

use std::fmt;
use std::result;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors returned by the range allocators.  Running out of backing space is
/// the only failure a well behaved caller will see.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum MemErr {
    #[error("Bad params {0:?}")]
    BadParams(String),

    #[error("Unable to allocate enough space")]
    OutOfSpace,

    #[error("Bad free requested {0:#x}")]
    BadFree(u64),
}

pub type Result<T> = result::Result<T, MemErr>;

/// Common interface of the address space allocator and the block pool.
///
/// Neither allocator records the size of an allocation, so the caller must
/// hand back exactly the length it asked for when freeing.
pub trait RangeAllocator {
    /// Converts to the address used for ordering and overlap tests.
    type Handle: Copy + fmt::Debug + Into<u64>;

    fn alloc(&mut self, len: u64) -> Result<Self::Handle>;
    fn free(&mut self, handle: Self::Handle, len: u64) -> Result<()>;

    /// Total length of the extents currently in the free set.
    fn free_bytes(&self) -> u64;

    /// Total length obtained from the backing provider.
    fn backed_bytes(&self) -> u64;

    fn check(&self) -> anyhow::Result<()>;
}

// Providers are shared with the caller.  A panic while one of them was
// locked leaves nothing for us to repair, so poisoning is ignored.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

//-------------------------------------
