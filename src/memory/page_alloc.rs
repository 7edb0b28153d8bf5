//! Per-core physical page allocator.
//!
//! Each core owns a LIFO free list behind its own spin lock. `alloc` pops
//! from the caller's list and, only if that is empty, makes one pass over
//! the other cores' lists. `free` always pushes onto the caller's list.
//! No thread ever holds two free-list locks at once.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use super::config::{AllocatorConfig, ALLOC_JUNK, FREE_JUNK};
use super::{PhysAddr, PhysMemory, PAGE_SIZE};
use crate::cpu;
use crate::error::{halt, KernelPanic, Result};
use crate::sync::SpinLock;

/// Free pages of one core, most recently freed last.
type FreeList = Vec<PhysAddr>;

/// Physical page allocator with one free list per core.
pub struct PageAllocator {
    memory: PhysMemory,
    /// First address after the kernel image.
    kernel_end: PhysAddr,
    /// End of physical RAM.
    phys_top: PhysAddr,
    lists: Box<[SpinLock<FreeList>]>,
    total_pages: usize,
    allocs: AtomicU64,
    frees: AtomicU64,
    steals: AtomicU64,
    failures: AtomicU64,
}

impl PageAllocator {
    /// Creates the allocator and frees every page above the kernel onto the
    /// calling core's list.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout is invalid or the RAM cannot be mapped.
    pub fn new(config: &AllocatorConfig) -> Result<Self> {
        config.validate()?;

        let start = config.first_page();
        let end = config.phys_top.page_round_down();
        let memory = PhysMemory::new(start, end)?;
        let total_pages = config.managed_pages();

        let lists = (0..config.ncpu)
            .map(|_| SpinLock::new(Vec::with_capacity(total_pages), "kmem"))
            .collect();

        let allocator = Self {
            memory,
            kernel_end: config.kernel_end,
            phys_top: config.phys_top,
            lists,
            total_pages,
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        };
        allocator.free_range(start, end);

        info!(
            ncpu = config.ncpu,
            pages = total_pages,
            start = %start,
            end = %end,
            "kinit: page allocator ready"
        );
        Ok(allocator)
    }

    fn free_range(&self, start: PhysAddr, end: PhysAddr) {
        let mut addr = start.page_round_up();
        while addr.as_usize() + PAGE_SIZE <= end.as_usize() {
            self.push_free(addr);
            addr = addr.add(PAGE_SIZE);
        }
    }

    /// Allocates one page.
    ///
    /// Tries the caller's own list first, then each other core's list once,
    /// in index order. Returns `None` if every list was empty when looked
    /// at; a page freed elsewhere during the scan may be missed.
    ///
    /// The returned page is filled with [`ALLOC_JUNK`].
    pub fn alloc(&self) -> Option<Page<'_>> {
        let cid = {
            let guard = cpu::push_off();
            let cid = self.checked_core(&guard);
            let popped = self.lists[cid].lock().pop();
            if let Some(addr) = popped {
                return Some(self.hand_out(addr));
            }
            cid
        };

        match self.steal(cid) {
            Some(addr) => Some(self.hand_out(addr)),
            None => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(core = cid, "kalloc: out of memory");
                None
            }
        }
    }

    fn steal(&self, cid: usize) -> Option<PhysAddr> {
        for (i, list) in self.lists.iter().enumerate() {
            if i == cid {
                continue;
            }
            let popped = list.lock().pop();
            if let Some(addr) = popped {
                self.steals.fetch_add(1, Ordering::Relaxed);
                debug!(core = cid, donor = i, addr = %addr, "kalloc: stole page");
                return Some(addr);
            }
        }
        None
    }

    #[allow(unsafe_code)]
    fn hand_out(&self, addr: PhysAddr) -> Page<'_> {
        // SAFETY: `addr` just left a free list, so nobody else owns it.
        unsafe { self.memory.fill_page(addr, ALLOC_JUNK) };
        self.allocs.fetch_add(1, Ordering::Relaxed);
        Page {
            addr,
            ptr: self.memory.page_ptr(addr),
            allocator: self,
        }
    }

    /// Returns a page to the calling core's free list.
    ///
    /// Halts with [`KernelPanic::ForeignPage`] if another allocator issued
    /// the page.
    pub fn free(&self, page: Page<'_>) {
        if !std::ptr::eq(page.allocator, self) {
            halt(KernelPanic::ForeignPage { addr: page.addr });
        }
        // SAFETY: the handle is consumed and was issued here, so the caller
        // gives up a page this allocator owns.
        #[allow(unsafe_code)]
        unsafe {
            self.free_addr(page.into_addr());
        }
    }

    /// Returns the page at `addr` to the calling core's free list.
    ///
    /// Halts with [`KernelPanic::BadFree`] if `addr` is not page aligned or
    /// lies outside `[kernel_end, phys_top)`.
    ///
    /// # Safety
    ///
    /// The caller must own the page: it was allocated here and no live
    /// [`Page`] or other reference to it remains.
    #[allow(unsafe_code)]
    pub unsafe fn free_addr(&self, addr: PhysAddr) {
        if !self.is_managed(addr) {
            halt(KernelPanic::BadFree { addr });
        }
        self.push_free(addr);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Rebuilds a page handle from an address obtained with [`Page::into_addr`].
    ///
    /// Returns `None` if `addr` is not a managed page.
    ///
    /// # Safety
    ///
    /// The caller must own the page and must not create a second handle to it.
    #[allow(unsafe_code)]
    pub unsafe fn page_from_addr(&self, addr: PhysAddr) -> Option<Page<'_>> {
        self.is_managed(addr).then(|| Page {
            addr,
            ptr: self.memory.page_ptr(addr),
            allocator: self,
        })
    }

    fn is_managed(&self, addr: PhysAddr) -> bool {
        addr.is_page_aligned()
            && addr >= self.kernel_end
            && addr < self.phys_top
            && self.memory.contains_page(addr)
    }

    #[allow(unsafe_code)]
    fn push_free(&self, addr: PhysAddr) {
        // SAFETY: the page is being returned, so the caller no longer uses it.
        unsafe { self.memory.fill_page(addr, FREE_JUNK) };

        let guard = cpu::push_off();
        let cid = self.checked_core(&guard);
        self.lists[cid].lock().push(addr);
    }

    fn checked_core(&self, guard: &cpu::PreemptGuard) -> usize {
        let core = guard.core_id();
        if core >= self.lists.len() {
            halt(KernelPanic::CoreOutOfRange {
                core,
                ncpu: self.lists.len(),
            });
        }
        core
    }

    /// Returns the number of cores.
    #[must_use]
    pub fn ncpu(&self) -> usize {
        self.lists.len()
    }

    /// Returns the number of pages the allocator manages.
    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Returns the number of free pages across all cores.
    ///
    /// Lists are counted one at a time, so the total is only exact when no
    /// other thread is allocating or freeing.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.lists.iter().map(|list| list.lock().len()).sum()
    }

    /// Returns the number of free pages on `core`'s list.
    ///
    /// # Panics
    ///
    /// Panics if `core` is not below [`ncpu`](Self::ncpu).
    #[must_use]
    pub fn free_pages_on(&self, core: usize) -> usize {
        self.lists[core].lock().len()
    }

    /// Returns allocator statistics.
    #[must_use]
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            total_pages: self.total_pages,
            free_pages: self.free_pages(),
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Resets the statistics counters.
    pub fn reset_stats(&self) {
        self.allocs.store(0, Ordering::Relaxed);
        self.frees.store(0, Ordering::Relaxed);
        self.steals.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAllocator")
            .field("memory", &self.memory)
            .field("ncpu", &self.lists.len())
            .field("total_pages", &self.total_pages)
            .finish_non_exhaustive()
    }
}

/// An allocated page.
///
/// The handle is the page's only owner. Dropping it without calling
/// [`PageAllocator::free`] leaks the page.
#[must_use = "dropping a page without freeing it leaks it"]
pub struct Page<'a> {
    addr: PhysAddr,
    ptr: NonNull<u8>,
    /// Issuer; keeps the mapping alive.
    allocator: &'a PageAllocator,
}

// SAFETY: a `Page` is the unique handle to its memory.
#[allow(unsafe_code)]
unsafe impl Send for Page<'_> {}
#[allow(unsafe_code)]
unsafe impl Sync for Page<'_> {}

impl Page<'_> {
    /// Physical address of the page.
    #[must_use]
    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    /// Page contents.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the handle owns `PAGE_SIZE` bytes at `ptr`, kept mapped by
        // the allocator it borrows.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Mutable page contents.
    #[allow(unsafe_code)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`; `&mut self` makes the borrow unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Gives up the handle, keeping only the address.
    #[must_use]
    pub fn into_addr(self) -> PhysAddr {
        self.addr
    }
}

impl std::fmt::Debug for Page<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("addr", &self.addr).finish()
    }
}

/// Page allocator statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocStats {
    /// Pages under management.
    pub total_pages: usize,
    /// Pages currently on some free list.
    pub free_pages: usize,
    /// Successful allocations.
    pub allocs: u64,
    /// Pages freed (not counting the initial seeding).
    pub frees: u64,
    /// Allocations served from another core's list.
    pub steals: u64,
    /// Allocations that found every list empty.
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::thread;

    fn expect_halt<F: FnOnce()>(f: F) -> KernelPanic {
        let payload = catch_unwind(AssertUnwindSafe(f)).unwrap_err();
        payload
            .downcast_ref::<KernelPanic>()
            .cloned()
            .expect("payload should be a KernelPanic")
    }

    /// Runs `f` on a fresh thread placed on `core`.
    fn on_core<'a, T: Send + 'a>(core: usize, f: impl FnOnce() -> T + Send + 'a) -> T {
        thread::scope(|s| {
            s.spawn(move || {
                cpu::set_current_core(core);
                f()
            })
            .join()
            .unwrap()
        })
    }

    #[test]
    fn test_seeded_on_init_core() {
        let alloc = on_core(1, || PageAllocator::new(&AllocatorConfig::with_pages(2, 4)).unwrap());
        assert_eq!(alloc.total_pages(), 4);
        assert_eq!(alloc.free_pages(), 4);
        assert_eq!(alloc.free_pages_on(0), 0);
        assert_eq!(alloc.free_pages_on(1), 4);
    }

    #[test]
    fn test_alloc_fills_junk() {
        let alloc = on_core(0, || PageAllocator::new(&AllocatorConfig::with_pages(1, 2)).unwrap());
        on_core(0, || {
            let page = alloc.alloc().unwrap();
            assert!(page.addr().is_page_aligned());
            assert!(page.as_slice().iter().all(|&b| b == ALLOC_JUNK));
            alloc.free(page);
        });
    }

    #[test]
    fn test_free_fills_junk() {
        let alloc = on_core(0, || PageAllocator::new(&AllocatorConfig::with_pages(1, 1)).unwrap());
        on_core(0, || {
            let mut page = alloc.alloc().unwrap();
            page.as_mut_slice().fill(0x42);
            let addr = page.addr();
            alloc.free(page);

            let ptr = alloc.memory.page_ptr(addr);
            #[allow(unsafe_code)]
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), PAGE_SIZE) };
            assert!(bytes.iter().all(|&b| b == FREE_JUNK));
        });
    }

    #[test]
    fn test_lifo_reuse() {
        let alloc = on_core(0, || PageAllocator::new(&AllocatorConfig::with_pages(1, 3)).unwrap());
        on_core(0, || {
            let page = alloc.alloc().unwrap();
            let addr = page.addr();
            alloc.free(page);
            let again = alloc.alloc().unwrap();
            assert_eq!(again.addr(), addr);
            alloc.free(again);
        });
    }

    #[test]
    fn test_free_goes_to_callers_core() {
        let alloc = on_core(0, || PageAllocator::new(&AllocatorConfig::with_pages(2, 2)).unwrap());
        let addr = on_core(0, || alloc.alloc().unwrap().into_addr());
        on_core(1, || {
            #[allow(unsafe_code)]
            unsafe {
                alloc.free_addr(addr);
            }
        });
        assert_eq!(alloc.free_pages_on(0), 1);
        assert_eq!(alloc.free_pages_on(1), 1);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let alloc = on_core(0, || PageAllocator::new(&AllocatorConfig::with_pages(2, 3)).unwrap());
        on_core(0, || {
            let pages: Vec<_> = (0..3).map(|_| alloc.alloc().unwrap()).collect();
            assert!(alloc.alloc().is_none());
            assert_eq!(alloc.stats().failures, 1);
            for page in pages {
                alloc.free(page);
            }
        });
        assert_eq!(alloc.free_pages(), 3);
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_free_misaligned_halts() {
        let alloc = on_core(0, || PageAllocator::new(&AllocatorConfig::with_pages(1, 2)).unwrap());
        let addr = alloc.memory.start().add(8);
        let reason = expect_halt(|| unsafe { alloc.free_addr(addr) });
        assert_eq!(reason, KernelPanic::BadFree { addr });
        assert_eq!(alloc.free_pages(), 2);
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_free_out_of_range_halts() {
        let config = AllocatorConfig::with_pages(1, 2);
        let alloc = on_core(0, || PageAllocator::new(&config).unwrap());

        let below = config.kernbase;
        assert_eq!(
            expect_halt(|| unsafe { alloc.free_addr(below) }),
            KernelPanic::BadFree { addr: below }
        );

        let above = config.phys_top;
        assert_eq!(
            expect_halt(|| unsafe { alloc.free_addr(above) }),
            KernelPanic::BadFree { addr: above }
        );
    }

    #[test]
    fn test_core_out_of_range_halts() {
        let alloc = on_core(0, || PageAllocator::new(&AllocatorConfig::with_pages(2, 2)).unwrap());
        let reason = on_core(5, || expect_halt(|| drop(alloc.alloc())));
        assert_eq!(reason, KernelPanic::CoreOutOfRange { core: 5, ncpu: 2 });
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_page_from_addr() {
        let alloc = on_core(0, || PageAllocator::new(&AllocatorConfig::with_pages(1, 2)).unwrap());
        on_core(0, || {
            let addr = alloc.alloc().unwrap().into_addr();
            let page = unsafe { alloc.page_from_addr(addr) }.unwrap();
            assert_eq!(page.addr(), addr);
            alloc.free(page);
            assert!(unsafe { alloc.page_from_addr(addr.add(1)) }.is_none());
        });
    }

    #[test]
    fn test_free_to_other_allocator_halts() {
        let config = AllocatorConfig::with_pages(1, 1);
        let a = on_core(0, || PageAllocator::new(&config).unwrap());
        let b = on_core(0, || PageAllocator::new(&config).unwrap());
        on_core(0, || {
            let held = b.alloc().unwrap();
            let page = a.alloc().unwrap();
            let addr = page.addr();
            // Same layout, so the address is in range for `b` too.
            assert_eq!(addr, held.addr());

            let reason = expect_halt(|| b.free(page));
            assert_eq!(reason, KernelPanic::ForeignPage { addr });
            assert_eq!(b.free_pages(), 0);
            assert!(b.alloc().is_none());
            b.free(held);
        });
        assert_eq!(b.free_pages(), 1);
        assert_eq!(a.free_pages(), 0);
    }

    #[test]
    fn test_stats() {
        let alloc = on_core(0, || PageAllocator::new(&AllocatorConfig::with_pages(2, 2)).unwrap());
        on_core(1, || {
            let page = alloc.alloc().unwrap();
            alloc.free(page);
        });
        let stats = alloc.stats();
        assert_eq!(stats.allocs, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.steals, 1);
        assert_eq!(stats.free_pages, 2);

        alloc.reset_stats();
        assert_eq!(alloc.stats().allocs, 0);
    }
}
