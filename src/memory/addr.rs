//! Physical address type.

use super::PAGE_SIZE;

/// A physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Wraps a raw address.
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw address.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns whether the address sits on a page boundary.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Rounds up to the next page boundary.
    #[must_use]
    pub const fn page_round_up(self) -> Self {
        Self((self.0 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
    }

    /// Rounds down to a page boundary.
    #[must_use]
    pub const fn page_round_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Returns the address `bytes` further on.
    #[must_use]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl std::fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
