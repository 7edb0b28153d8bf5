//! Physical memory management.
//!
//! This module provides the kernel's page allocator:
//! - [`PhysAddr`]: physical address newtype
//! - [`PhysMemory`]: RAM backing the managed physical range
//! - [`PageAllocator`]: per-core free lists with cross-core stealing
//! - [`Page`]: owning handle to an allocated page
//!
//! # Example
//!
//! ```ignore
//! let kmem = PageAllocator::new(&AllocatorConfig::default())?;
//! let page = kmem.alloc().expect("out of memory");
//! // use page.as_mut_slice()
//! kmem.free(page);
//! ```

mod addr;
mod page_alloc;
mod phys;

pub mod config;

pub use addr::PhysAddr;
pub use config::AllocatorConfig;
pub use page_alloc::{AllocStats, Page, PageAllocator};
pub use phys::PhysMemory;

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;
