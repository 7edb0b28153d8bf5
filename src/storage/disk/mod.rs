//! Block devices.
//!
//! The buffer cache moves whole blocks through a [`BlockDevice`]. Two
//! devices are provided:
//! - [`MemDisk`]: sparse in-memory device with transfer counters
//! - [`FileDisk`]: device backed by a file

mod file_disk;
mod mem_disk;

pub use file_disk::FileDisk;
pub use mem_disk::MemDisk;

use super::{BlockId, BLOCK_SIZE};

/// The disk-transfer primitive.
///
/// Both calls block the calling thread until the transfer completes. There
/// is no error path: a device that cannot complete a transfer halts.
pub trait BlockDevice: Send + Sync {
    /// Reads block `id` into `buf`.
    fn read_block(&self, id: BlockId, buf: &mut [u8; BLOCK_SIZE]);

    /// Writes `buf` to block `id`.
    fn write_block(&self, id: BlockId, buf: &[u8; BLOCK_SIZE]);
}
