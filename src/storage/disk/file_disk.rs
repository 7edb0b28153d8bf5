//! File-backed block device.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::BlockDevice;
use crate::error::{halt, KernelError, KernelPanic, Result};
use crate::storage::{BlockId, BLOCK_SIZE};

/// A disk image file serving one device number.
///
/// Block `n` lives at byte offset `n * BLOCK_SIZE`. Blocks past the end of
/// the file read as zeros.
pub struct FileDisk {
    /// Path to the image file.
    path: PathBuf,
    /// Device number this image answers to.
    dev: u32,
    file: Mutex<File>,
}

impl FileDisk {
    /// Opens or creates a disk image.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path, dev: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| KernelError::StorageError(format!("Failed to open disk image: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            dev,
            file: Mutex::new(file),
        })
    }

    /// Returns the path to the image file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the device number.
    #[must_use]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Returns the number of whole or partial blocks in the image.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn num_blocks(&self) -> Result<u64> {
        self.file
            .lock()
            .metadata()
            .map(|m| m.len().div_ceil(BLOCK_SIZE as u64))
            .map_err(|e| KernelError::StorageError(format!("Failed to get image size: {e}")))
    }

    /// Flushes written blocks to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_all()
            .map_err(|e| KernelError::StorageError(format!("Failed to sync disk image: {e}")))
    }

    fn check_dev(&self, id: BlockId) {
        if id.dev != self.dev {
            halt(KernelPanic::DiskFailure {
                dev: id.dev,
                blockno: id.blockno,
                reason: format!("no such device (image serves dev {})", self.dev),
            });
        }
    }
}

fn failure(id: BlockId, what: &str, e: &std::io::Error) -> ! {
    halt(KernelPanic::DiskFailure {
        dev: id.dev,
        blockno: id.blockno,
        reason: format!("{what}: {e}"),
    })
}

impl BlockDevice for FileDisk {
    fn read_block(&self, id: BlockId, buf: &mut [u8; BLOCK_SIZE]) {
        self.check_dev(id);
        let mut file = self.file.lock();

        if let Err(e) = file.seek(SeekFrom::Start(id.offset())) {
            failure(id, "seek", &e);
        }

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => failure(id, "read", &e),
            }
        }
        // Short read at end of image
        buf[filled..].fill(0);
    }

    fn write_block(&self, id: BlockId, buf: &[u8; BLOCK_SIZE]) {
        self.check_dev(id);
        let mut file = self.file.lock();

        if let Err(e) = file.seek(SeekFrom::Start(id.offset())) {
            failure(id, "seek", &e);
        }
        if let Err(e) = file.write_all(buf) {
            failure(id, "write", &e);
        }
    }
}

impl std::fmt::Debug for FileDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDisk")
            .field("path", &self.path)
            .field("dev", &self.dev)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use tempfile::TempDir;

    fn create_test_disk() -> (FileDisk, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fs.img");
        let disk = FileDisk::open(&path, 1).unwrap();
        (disk, temp_dir)
    }

    #[test]
    fn test_create_disk() {
        let (disk, _temp) = create_test_disk();
        assert_eq!(disk.dev(), 1);
        assert_eq!(disk.num_blocks().unwrap(), 0);
    }

    #[test]
    fn test_read_write_block() {
        let (disk, _temp) = create_test_disk();
        let id = BlockId::new(1, 2);

        let mut data = [0u8; BLOCK_SIZE];
        data[0] = 42;
        data[100] = 0xFF;
        disk.write_block(id, &data);

        let mut buf = [0u8; BLOCK_SIZE];
        disk.read_block(id, &mut buf);
        assert_eq!(buf[0], 42);
        assert_eq!(buf[100], 0xFF);
        assert_eq!(disk.num_blocks().unwrap(), 3);
    }

    #[test]
    fn test_read_past_end() {
        let (disk, _temp) = create_test_disk();
        let mut buf = [0xAAu8; BLOCK_SIZE];
        disk.read_block(BlockId::new(1, 100), &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fs.img");

        {
            let disk = FileDisk::open(&path, 1).unwrap();
            let mut data = [0u8; BLOCK_SIZE];
            data[0..4].copy_from_slice(&[1, 2, 3, 4]);
            disk.write_block(BlockId::new(1, 0), &data);
            disk.sync().unwrap();
        }

        {
            let disk = FileDisk::open(&path, 1).unwrap();
            let mut buf = [0u8; BLOCK_SIZE];
            disk.read_block(BlockId::new(1, 0), &mut buf);
            assert_eq!(&buf[0..4], &[1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_wrong_device_halts() {
        let (disk, _temp) = create_test_disk();
        let payload = catch_unwind(AssertUnwindSafe(|| {
            let mut buf = [0u8; BLOCK_SIZE];
            disk.read_block(BlockId::new(2, 0), &mut buf);
        }))
        .unwrap_err();
        assert!(matches!(
            payload.downcast_ref::<KernelPanic>(),
            Some(KernelPanic::DiskFailure { dev: 2, .. })
        ));
    }
}
