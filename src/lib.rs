//! Free-list range allocators.
//!
//! [`AddrSpaceAllocator`](allocators::AddrSpaceAllocator) hands out ranges
//! of an abstract address space that grows through a chunk or region
//! provider.  [`BlockPool`](allocators::BlockPool) hands out real memory
//! carved from blocks obtained from a byte allocator.  Both keep their free
//! extents in a [`FreeExtentIndex`](allocators::FreeExtentIndex), choose the
//! best fitting extent on alloc and coalesce neighbours on free.
//!
//! Neither allocator is thread safe; callers serialise access.

pub mod allocators;
