//! Page allocator configuration.

use super::{PhysAddr, PAGE_SIZE};
use crate::error::{KernelError, Result};

/// Maximum number of cores.
pub const NCPU: usize = 8;

/// Start of physical RAM.
pub const KERNBASE: usize = 0x8000_0000;

/// End of physical RAM managed by the allocator.
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

/// Default end of the kernel image (first address after it).
pub const KERNEL_END: usize = KERNBASE + 0x2_1a38;

/// Byte written over a page when it is freed.
pub const FREE_JUNK: u8 = 0x01;

/// Byte written over a page when it is allocated.
pub const ALLOC_JUNK: u8 = 0x05;

/// Physical memory layout and core count for a [`PageAllocator`](super::PageAllocator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Number of cores, each with its own free list.
    pub ncpu: usize,
    /// Start of physical RAM.
    pub kernbase: PhysAddr,
    /// First address after the kernel image; pages below it are never managed.
    pub kernel_end: PhysAddr,
    /// End of physical RAM.
    pub phys_top: PhysAddr,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            ncpu: NCPU,
            kernbase: PhysAddr::new(KERNBASE),
            kernel_end: PhysAddr::new(KERNEL_END),
            phys_top: PhysAddr::new(PHYSTOP),
        }
    }
}

impl AllocatorConfig {
    /// Builds a layout that manages exactly `pages` pages for `ncpu` cores.
    ///
    /// The kernel image ends part-way through a page so the first managed
    /// page is the one after it.
    #[must_use]
    pub fn with_pages(ncpu: usize, pages: usize) -> Self {
        let kernbase = PhysAddr::new(KERNBASE);
        let kernel_end = kernbase.add(PAGE_SIZE / 2);
        let phys_top = kernel_end.page_round_up().add(pages * PAGE_SIZE);
        Self {
            ncpu,
            kernbase,
            kernel_end,
            phys_top,
        }
    }

    /// Sets the number of cores.
    #[must_use]
    pub fn with_ncpu(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self
    }

    /// First page handed to the allocator.
    #[must_use]
    pub fn first_page(&self) -> PhysAddr {
        self.kernel_end.page_round_up()
    }

    /// Number of whole pages between the end of the kernel and `phys_top`.
    #[must_use]
    pub fn managed_pages(&self) -> usize {
        self.phys_top
            .as_usize()
            .saturating_sub(self.first_page().as_usize())
            / PAGE_SIZE
    }

    /// Checks the layout.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no cores, the addresses are out of
    /// order, or no whole page fits above the kernel.
    pub fn validate(&self) -> Result<()> {
        if self.ncpu == 0 {
            return Err(KernelError::ConfigError(
                "ncpu must be greater than 0".into(),
            ));
        }
        if self.kernel_end < self.kernbase || self.phys_top <= self.kernel_end {
            return Err(KernelError::ConfigError(format!(
                "physical layout out of order: kernbase {} kernel_end {} phys_top {}",
                self.kernbase, self.kernel_end, self.phys_top
            )));
        }
        if self.managed_pages() == 0 {
            return Err(KernelError::ConfigError(format!(
                "no free pages between {} and {}",
                self.kernel_end, self.phys_top
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let config = AllocatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ncpu, NCPU);
        assert_eq!(config.first_page(), PhysAddr::new(KERNBASE + 0x2_2000));
    }

    #[test]
    fn test_with_pages() {
        let config = AllocatorConfig::with_pages(2, 5);
        assert!(config.validate().is_ok());
        assert_eq!(config.managed_pages(), 5);
        assert!(config.first_page() > config.kernel_end);
    }

    #[test]
    fn test_validation() {
        assert!(AllocatorConfig::with_pages(0, 4).validate().is_err());
        assert!(AllocatorConfig::with_pages(2, 0).validate().is_err());

        let mut config = AllocatorConfig::with_pages(1, 4);
        config.phys_top = config.kernbase;
        assert!(config.validate().is_err());
    }
}
