//! Block buffer cache.
//!
//! This module caches disk blocks in a fixed pool of buffers. It provides:
//! - One cached copy per block, handed to one thread at a time
//! - Per-bucket LRU recycling of unreferenced buffers
//! - Stealing from other buckets when a bucket has no free buffer
//! - RAII handles (`Buf`) that release their buffer when dropped
//!
//! # Architecture
//!
//! Buffers are partitioned by `blockno % nbucket` into buckets, each a
//! recency list behind its own spin lock. Bucket locks guard membership,
//! identity and reference counts; a buffer's payload is guarded by its own
//! sleep lock. A lookup that finds its bucket fully referenced takes the
//! global steal lock before locking a second bucket, so at most one thread
//! ever holds two bucket locks.
//!
//! # Example
//!
//! ```ignore
//! let cache = BufferCache::new(CacheConfig::default(), Arc::new(MemDisk::new()))?;
//! let mut buf = cache.read(1, 42);
//! buf.data_mut()[0] = 7;
//! cache.write(&mut buf);
//! cache.release(buf);
//! ```

mod buffer;
mod config;
mod lru;

pub use config::{CacheConfig, MAXOPBLOCKS, NBUCKET, NBUF};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, trace};

use buffer::BufMeta;
use lru::{Bucket, LruLinks};

use super::disk::BlockDevice;
use super::{BlockId, BLOCK_SIZE};
use crate::error::{halt, KernelPanic, Result};
use crate::sync::{SleepLock, SleepLockGuard, SpinLock, SpinLockGuard};

/// Payload of one buffer.
pub type BlockData = [u8; BLOCK_SIZE];

/// Cache of disk blocks over a fixed pool of buffers.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    /// Serializes every cross-bucket move.
    steal_lock: SpinLock<()>,
    buckets: Box<[SpinLock<Bucket>]>,
    links: LruLinks,
    meta: Box<[BufMeta]>,
    data: Box<[SleepLock<BlockData>]>,
    hits: AtomicU64,
    misses: AtomicU64,
    recycles: AtomicU64,
    steals: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

impl BufferCache {
    /// Creates a cache over `device` and spreads the pool across the buckets.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: CacheConfig, device: Arc<dyn BlockDevice>) -> Result<Self> {
        config.validate()?;

        let (links, buckets) = LruLinks::new(config.nbuf, config.nbucket);
        let buckets: Box<[SpinLock<Bucket>]> = buckets
            .into_iter()
            .map(|bucket| SpinLock::new(bucket, "bcache bucket"))
            .collect();

        for b in 0..config.nbuf {
            let mut bucket = buckets[b % config.nbucket].lock();
            links.push_front(&mut bucket, b);
        }

        let meta = (0..config.nbuf).map(|_| BufMeta::new()).collect();
        let data = (0..config.nbuf)
            .map(|_| SleepLock::new([0u8; BLOCK_SIZE], "buffer"))
            .collect();

        info!(
            nbuf = config.nbuf,
            nbucket = config.nbucket,
            "binit: buffer cache ready"
        );

        Ok(Self {
            device,
            steal_lock: SpinLock::new((), "bcache steal"),
            buckets,
            links,
            meta,
            data,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            disk_reads: AtomicU64::new(0),
            disk_writes: AtomicU64::new(0),
        })
    }

    /// Returns the number of buffers in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.meta.len()
    }

    /// Returns the number of buckets.
    #[must_use]
    pub fn nbucket(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, blockno: u32) -> usize {
        blockno as usize % self.buckets.len()
    }

    /// Returns a locked buffer holding the current contents of the block.
    ///
    /// Blocks until no other thread holds the buffer. Reads the block from
    /// the device if the cached copy is not valid. Halts if every buffer in
    /// the pool is referenced.
    pub fn read(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut buf = self.get(BlockId::new(dev, blockno));
        let meta = &self.meta[buf.slot];
        if !meta.is_valid() {
            let id = buf.id;
            self.device.read_block(id, buf.data_mut());
            meta.set_valid();
            self.disk_reads.fetch_add(1, Ordering::Relaxed);
        }
        buf
    }

    /// Halts unless `buf` was issued by this cache.
    fn check_owner(&self, buf: &Buf<'_>) {
        if !std::ptr::eq(buf.cache, self) {
            halt(KernelPanic::ForeignBuffer { slot: buf.slot });
        }
    }

    /// Writes the buffer's payload to the device.
    ///
    /// The buffer becomes the most recently used in its bucket. Halts if the
    /// calling thread does not hold the buffer or another cache issued it.
    pub fn write(&self, buf: &mut Buf<'_>) {
        self.check_owner(buf);
        if !buf.guard().holding() {
            halt(KernelPanic::WriteWithoutLock { slot: buf.slot });
        }
        self.device.write_block(buf.id, buf.data());
        self.disk_writes.fetch_add(1, Ordering::Relaxed);

        let mut bucket = self.buckets[self.bucket_index(buf.id.blockno)].lock();
        self.links.move_to_front(&mut bucket, buf.slot);
    }

    /// Releases a buffer.
    ///
    /// Equivalent to dropping it. Halts if the calling thread does not hold
    /// the buffer or another cache issued it.
    pub fn release(&self, buf: Buf<'_>) {
        self.check_owner(&buf);
        drop(buf);
    }

    /// Takes an extra reference so the buffer stays cached after release.
    ///
    /// Halts if another cache issued the buffer.
    pub fn pin(&self, buf: &Buf<'_>) {
        self.check_owner(buf);
        let _bucket = self.buckets[self.bucket_index(buf.id.blockno)].lock();
        self.meta[buf.slot].pin();
    }

    /// Drops a reference taken with [`pin`](Self::pin).
    ///
    /// Pins are counted apart from holders and waiters, so this halts if the
    /// buffer has no pin even while other threads wait for it. Also halts if
    /// another cache issued the buffer.
    pub fn unpin(&self, buf: &Buf<'_>) {
        self.check_owner(buf);
        let _bucket = self.buckets[self.bucket_index(buf.id.blockno)].lock();
        if !self.meta[buf.slot].unpin() {
            halt(KernelPanic::UnpinWithoutPin { slot: buf.slot });
        }
    }

    /// Finds or assigns a buffer for `id` and locks it.
    fn get(&self, id: BlockId) -> Buf<'_> {
        let index = self.bucket_index(id.blockno);
        let mut bucket = self.buckets[index].lock();

        if let Some(slot) = self.claim_in_bucket(&mut bucket, id) {
            drop(bucket);
            return self.lock_buf(slot, id);
        }

        // Nothing free here. Take the steal lock; if another thread is
        // stealing it may be waiting for this bucket, so let go of it first
        // and look again once it is back.
        let steal = match self.steal_lock.try_lock() {
            Some(steal) => steal,
            None => {
                drop(bucket);
                let steal = self.steal_lock.lock();
                bucket = self.buckets[index].lock();
                if let Some(slot) = self.claim_in_bucket(&mut bucket, id) {
                    drop(steal);
                    drop(bucket);
                    return self.lock_buf(slot, id);
                }
                steal
            }
        };

        let slot = self.steal(index, &mut bucket, steal, id);
        drop(bucket);
        self.lock_buf(slot, id)
    }

    /// Looks for `id` in the bucket, else recycles the bucket's least
    /// recently used free buffer. Either way the buffer gains a reference
    /// and moves to the front.
    fn claim_in_bucket(&self, bucket: &mut Bucket, id: BlockId) -> Option<usize> {
        let hit = self
            .links
            .iter_mru(bucket)
            .find(|&b| self.meta[b].holds(id));
        if let Some(b) = hit {
            self.meta[b].inc_ref();
            self.links.move_to_front(bucket, b);
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(block = %id, slot = b, "bget: hit");
            return Some(b);
        }

        let free = self.links.iter_lru(bucket).find(|&b| self.meta[b].is_free())?;
        self.meta[free].rebind(id);
        self.links.move_to_front(bucket, free);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.recycles.fetch_add(1, Ordering::Relaxed);
        debug!(block = %id, slot = free, "bget: recycled");
        Some(free)
    }

    /// Moves a free buffer from some other bucket into `target`.
    ///
    /// Scans the other buckets round-robin from `index + 1`, one at a time.
    /// Halts if none has a free buffer.
    fn steal(
        &self,
        index: usize,
        target: &mut Bucket,
        steal: SpinLockGuard<'_, ()>,
        id: BlockId,
    ) -> usize {
        let n = self.buckets.len();
        let mut i = (index + 1) % n;
        while i != index {
            let mut donor = self.buckets[i].lock();
            let victim = self.links.iter_lru(&donor).find(|&b| self.meta[b].is_free());
            if let Some(b) = victim {
                drop(steal);
                self.meta[b].rebind(id);
                self.links.unlink(&mut donor, b);
                drop(donor);
                self.links.push_front(target, b);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.steals.fetch_add(1, Ordering::Relaxed);
                debug!(block = %id, slot = b, from = i, to = index, "bget: stole buffer");
                return b;
            }
            drop(donor);
            i = (i + 1) % n;
        }

        halt(KernelPanic::NoBuffers {
            dev: id.dev,
            blockno: id.blockno,
        })
    }

    fn lock_buf(&self, slot: usize, id: BlockId) -> Buf<'_> {
        let guard = self.data[slot].lock();
        Buf {
            cache: self,
            slot,
            id,
            guard: Some(guard),
        }
    }

    /// Drops the holder's reference after giving up the sleep lock.
    fn brelse(&self, slot: usize, id: BlockId, guard: SleepLockGuard<'_, BlockData>) {
        if !guard.holding() {
            halt(KernelPanic::ReleaseWithoutLock { slot });
        }
        drop(guard);

        let mut bucket = self.buckets[self.bucket_index(id.blockno)].lock();
        if self.meta[slot].dec_ref() == 0 {
            self.links.move_to_back(&mut bucket, slot);
        }
    }

    /// Returns every bucket's buffers in most to least recently used order.
    ///
    /// Buckets are locked one at a time, so the result is only consistent
    /// across buckets when no other thread is using the cache.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(index, lock)| {
                let bucket = lock.lock();
                let buffers = self
                    .links
                    .iter_mru(&bucket)
                    .map(|slot| {
                        let meta = &self.meta[slot];
                        BufferInfo {
                            slot,
                            block: meta.block_id(),
                            refcnt: meta.refcnt(),
                            pins: meta.pins(),
                            valid: meta.is_valid(),
                        }
                    })
                    .collect();
                debug_assert_eq!(bucket.len(), self.links.iter_mru(&bucket).count());
                BucketSnapshot { index, buffers }
            })
            .collect()
    }

    /// Returns cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity(),
            buckets: self.nbucket(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
        }
    }

    /// Resets the statistics counters.
    pub fn reset_stats(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.recycles,
            &self.steals,
            &self.disk_reads,
            &self.disk_writes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("nbuf", &self.capacity())
            .field("nbucket", &self.nbucket())
            .finish_non_exhaustive()
    }
}

/// A locked buffer.
///
/// The holder has exclusive access to the payload. Dropping the handle
/// releases the buffer; while unwinding from a halt the reference is
/// leaked instead.
pub struct Buf<'a> {
    cache: &'a BufferCache,
    slot: usize,
    id: BlockId,
    /// `Some` until the buffer is released.
    guard: Option<SleepLockGuard<'a, BlockData>>,
}

impl Buf<'_> {
    /// Returns the block this buffer caches.
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.id
    }

    /// Returns the device number.
    #[must_use]
    pub fn dev(&self) -> u32 {
        self.id.dev
    }

    /// Returns the block number.
    #[must_use]
    pub fn blockno(&self) -> u32 {
        self.id.blockno
    }

    /// Returns the index of the buffer in the pool.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Returns the payload.
    #[must_use]
    pub fn data(&self) -> &BlockData {
        self.guard()
    }

    /// Returns the payload for modification. Call
    /// [`BufferCache::write`] to store it.
    pub fn data_mut(&mut self) -> &mut BlockData {
        match self.guard.as_mut() {
            Some(guard) => guard,
            None => unreachable!("buffer used after release"),
        }
    }

    /// Computes the CRC32 checksum of the payload.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(self.data())
    }

    fn guard(&self) -> &SleepLockGuard<'_, BlockData> {
        match self.guard.as_ref() {
            Some(guard) => guard,
            None => unreachable!("buffer used after release"),
        }
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        if thread::panicking() {
            return;
        }
        self.cache.brelse(self.slot, self.id, guard);
    }
}

impl std::fmt::Debug for Buf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buf")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// One bucket as seen by [`BufferCache::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Bucket index.
    pub index: usize,
    /// Buffers from most to least recently used.
    pub buffers: Vec<BufferInfo>,
}

/// State of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Index in the pool.
    pub slot: usize,
    /// Cached block, `None` if never used.
    pub block: Option<BlockId>,
    /// Holders plus pins.
    pub refcnt: u32,
    /// Outstanding pins.
    pub pins: u32,
    /// Payload matches the block on disk.
    pub valid: bool,
}

/// Statistics about the buffer cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Buffers in the pool.
    pub capacity: usize,
    /// Number of buckets.
    pub buckets: usize,
    /// Lookups that found the block already cached.
    pub hits: u64,
    /// Lookups that had to assign a buffer.
    pub misses: u64,
    /// Misses served from the block's own bucket.
    pub recycles: u64,
    /// Misses served by taking a buffer from another bucket.
    pub steals: u64,
    /// Blocks read from the device.
    pub disk_reads: u64,
    /// Blocks written to the device.
    pub disk_writes: u64,
}

impl CacheStats {
    /// Calculates the cache hit rate (0.0 to 1.0).
    ///
    /// Returns `None` if there have been no lookups.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.total_accesses();
        if total == 0 {
            None
        } else {
            Some(self.hits as f64 / total as f64)
        }
    }

    /// Returns the total number of lookups (hits + misses).
    #[must_use]
    pub fn total_accesses(&self) -> u64 {
        self.hits + self.misses
    }
}
