//! Backing store for the managed physical range.
//!
//! The allocator hands out pages by physical address. `PhysMemory` maps
//! that address range onto an anonymous memory mapping so page contents
//! can actually be read and written.

use std::ptr::NonNull;

use memmap2::MmapMut;

use super::{PhysAddr, PAGE_SIZE};
use crate::error::{KernelError, Result};

/// RAM standing in for the physical range `[start, end)`.
///
/// # Safety
///
/// `PhysMemory` hands out raw pointers. Exclusive access to a page is the
/// caller's responsibility; the page allocator provides it by giving each
/// page to at most one owner at a time.
pub struct PhysMemory {
    /// Keeps the mapping alive; accessed only through `base`.
    _mmap: MmapMut,
    base: NonNull<u8>,
    start: PhysAddr,
    end: PhysAddr,
}

// SAFETY: the mapping is plain memory; synchronization of page contents is
// up to page owners (see the type-level docs).
#[allow(unsafe_code)]
unsafe impl Send for PhysMemory {}
#[allow(unsafe_code)]
unsafe impl Sync for PhysMemory {}

impl PhysMemory {
    /// Maps RAM for the page-aligned range `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is empty or misaligned, or the mapping fails.
    pub fn new(start: PhysAddr, end: PhysAddr) -> Result<Self> {
        if !start.is_page_aligned() || !end.is_page_aligned() || end <= start {
            return Err(KernelError::ConfigError(format!(
                "invalid physical range {start}..{end}"
            )));
        }

        let len = end.as_usize() - start.as_usize();
        let mut mmap = MmapMut::map_anon(len).map_err(|e| {
            KernelError::ConfigError(format!("Failed to map {len} bytes of physical memory: {e}"))
        })?;
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| KernelError::ConfigError("anonymous mapping returned null".into()))?;
        if base.as_ptr() as usize % PAGE_SIZE != 0 {
            return Err(KernelError::ConfigError(
                "anonymous mapping is not page aligned".into(),
            ));
        }

        Ok(Self {
            _mmap: mmap,
            base,
            start,
            end,
        })
    }

    /// First managed address.
    #[must_use]
    pub fn start(&self) -> PhysAddr {
        self.start
    }

    /// One past the last managed address.
    #[must_use]
    pub fn end(&self) -> PhysAddr {
        self.end
    }

    /// Returns whether `[addr, addr + PAGE_SIZE)` lies inside the range.
    #[must_use]
    pub fn contains_page(&self, addr: PhysAddr) -> bool {
        addr >= self.start && addr.as_usize() + PAGE_SIZE <= self.end.as_usize()
    }

    /// Returns a pointer to the first byte of the page at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the page is not inside the range.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn page_ptr(&self, addr: PhysAddr) -> NonNull<u8> {
        assert!(self.contains_page(addr), "Page {addr} out of bounds");
        let offset = addr.as_usize() - self.start.as_usize();
        // SAFETY: `offset + PAGE_SIZE` is within the mapping, checked above.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Fills the page at `addr` with `byte`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the page.
    #[allow(unsafe_code)]
    pub unsafe fn fill_page(&self, addr: PhysAddr, byte: u8) {
        let ptr = self.page_ptr(addr);
        std::ptr::write_bytes(ptr.as_ptr(), byte, PAGE_SIZE);
    }
}

impl std::fmt::Debug for PhysMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysMemory")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}
