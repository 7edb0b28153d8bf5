//! Disk block identifier type.

use super::BLOCK_SIZE;

/// Identity of a disk block.
///
/// A block is identified by:
/// - `dev`: the device number
/// - `blockno`: the block number on that device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    /// Device number.
    pub dev: u32,
    /// Block index within the device.
    pub blockno: u32,
}

impl BlockId {
    /// Creates a new block ID.
    #[must_use]
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }

    /// Returns the byte offset of this block on its device.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        (self.blockno as u64) * (BLOCK_SIZE as u64)
    }

    pub(crate) const fn pack(self) -> u64 {
        ((self.dev as u64) << 32) | self.blockno as u64
    }

    pub(crate) const fn unpack(packed: u64) -> Self {
        Self {
            dev: (packed >> 32) as u32,
            blockno: packed as u32,
        }
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Block({}/{})", self.dev, self.blockno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_creation() {
        let id = BlockId::new(1, 42);
        assert_eq!(id.dev, 1);
        assert_eq!(id.blockno, 42);
    }

    #[test]
    fn test_block_offset() {
        assert_eq!(BlockId::new(1, 0).offset(), 0);
        assert_eq!(BlockId::new(1, 3).offset(), 3 * BLOCK_SIZE as u64);
    }

    #[test]
    fn test_pack() {
        for id in [BlockId::new(7, 0xdead), BlockId::new(u32::MAX, u32::MAX)] {
            assert_eq!(BlockId::unpack(id.pack()), id);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(BlockId::new(1, 5).to_string(), "Block(1/5)");
    }
}
