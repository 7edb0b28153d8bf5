//! In-memory block device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::BlockDevice;
use crate::storage::{BlockId, BLOCK_SIZE};

/// A sparse in-memory disk.
///
/// Blocks that were never written read as zeros. Every transfer is counted,
/// globally and per block, so callers can tell whether the cache went to
/// the device.
#[derive(Default)]
pub struct MemDisk {
    blocks: Mutex<HashMap<BlockId, Box<[u8; BLOCK_SIZE]>>>,
    read_counts: Mutex<HashMap<BlockId, u64>>,
    reads: AtomicU64,
    writes: AtomicU64,
    /// Time each transfer takes.
    latency: Option<Duration>,
}

impl MemDisk {
    /// Creates an empty disk with instant transfers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty disk where every transfer sleeps for `latency`.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns the current contents of block `id` without counting a transfer.
    #[must_use]
    pub fn contents(&self, id: BlockId) -> [u8; BLOCK_SIZE] {
        self.blocks
            .lock()
            .get(&id)
            .map_or([0u8; BLOCK_SIZE], |data| **data)
    }

    /// Overwrites block `id` without counting a transfer.
    pub fn set_contents(&self, id: BlockId, data: &[u8; BLOCK_SIZE]) {
        self.blocks.lock().insert(id, Box::new(*data));
    }

    /// Total read transfers.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total write transfers.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Read transfers of block `id`.
    #[must_use]
    pub fn read_count(&self, id: BlockId) -> u64 {
        self.read_counts.lock().get(&id).copied().unwrap_or(0)
    }

    fn delay(&self) {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, id: BlockId, buf: &mut [u8; BLOCK_SIZE]) {
        self.delay();
        *buf = self.contents(id);
        *self.read_counts.lock().entry(id).or_insert(0) += 1;
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_block(&self, id: BlockId, buf: &[u8; BLOCK_SIZE]) {
        self.delay();
        self.set_contents(id, buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MemDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDisk")
            .field("blocks", &self.blocks.lock().len())
            .field("reads", &self.reads())
            .field("writes", &self.writes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_block_reads_zero() {
        let disk = MemDisk::new();
        let mut buf = [0xFFu8; BLOCK_SIZE];
        disk.read_block(BlockId::new(1, 100), &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn test_read_write_block() {
        let disk = MemDisk::new();
        let id = BlockId::new(1, 3);

        let mut data = [0u8; BLOCK_SIZE];
        data[0] = 42;
        data[BLOCK_SIZE - 1] = 0xFF;
        disk.write_block(id, &data);

        let mut buf = [0u8; BLOCK_SIZE];
        disk.read_block(id, &mut buf);
        assert_eq!(buf[0], 42);
        assert_eq!(buf[BLOCK_SIZE - 1], 0xFF);

        assert_eq!(disk.writes(), 1);
        assert_eq!(disk.read_count(id), 1);
        assert_eq!(disk.read_count(BlockId::new(2, 3)), 0);
    }

    #[test]
    fn test_contents_does_not_count() {
        let disk = MemDisk::new();
        let id = BlockId::new(1, 0);
        disk.set_contents(id, &[9u8; BLOCK_SIZE]);
        assert_eq!(disk.contents(id)[10], 9);
        assert_eq!(disk.reads(), 0);
        assert_eq!(disk.writes(), 0);
    }
}
