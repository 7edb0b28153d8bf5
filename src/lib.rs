//! kcore - kernel buffer cache and physical page allocator
//!
//! Two concurrent kernel subsystems run on host threads:
//! - [`storage::BufferCache`]: a bucketed, LRU block cache with cross-bucket
//!   stealing
//! - [`memory::PageAllocator`]: per-core free page lists with cross-core
//!   stealing
//!
//! Invariant violations halt through [`error::halt`]; ordinary failures are
//! returned as [`KernelError`].

pub mod cpu;
pub mod error;
pub mod memory;
pub mod storage;
pub mod sync;

pub use error::{halt, KernelError, KernelPanic, Result};
pub use memory::{AllocatorConfig, Page, PageAllocator, PhysAddr, PAGE_SIZE};
pub use storage::{
    BlockDevice, BlockId, Buf, BufferCache, CacheConfig, FileDisk, MemDisk, BLOCK_SIZE,
};
