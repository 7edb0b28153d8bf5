//! Per-buffer cache metadata.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::storage::block_id::BlockId;

/// Bookkeeping for one buffer in the pool.
///
/// - `id`, `bound`, `refcnt` and `pins` change only under the lock of the
///   buffer's bucket
/// - `valid` is set by the sleep-lock holder after a disk read, and cleared
///   under the bucket lock when an unreferenced buffer is rebound
///
/// The locks order every access, so relaxed atomics suffice.
#[derive(Debug)]
pub(crate) struct BufMeta {
    /// Packed [`BlockId`]; meaningless until `bound` is set.
    id: AtomicU64,
    /// Set on first use.
    bound: AtomicBool,
    /// Holders plus pins.
    refcnt: AtomicU32,
    /// Pins included in `refcnt`.
    pins: AtomicU32,
    /// Payload matches the block on disk.
    valid: AtomicBool,
}

impl BufMeta {
    pub(crate) fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            bound: AtomicBool::new(false),
            refcnt: AtomicU32::new(0),
            pins: AtomicU32::new(0),
            valid: AtomicBool::new(false),
        }
    }

    pub(crate) fn block_id(&self) -> Option<BlockId> {
        self.bound
            .load(Ordering::Relaxed)
            .then(|| BlockId::unpack(self.id.load(Ordering::Relaxed)))
    }

    pub(crate) fn holds(&self, id: BlockId) -> bool {
        self.bound.load(Ordering::Relaxed) && self.id.load(Ordering::Relaxed) == id.pack()
    }

    pub(crate) fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    /// Returns whether the buffer may be recycled.
    pub(crate) fn is_free(&self) -> bool {
        self.refcnt() == 0
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_valid(&self) {
        self.valid.store(true, Ordering::Relaxed);
    }

    /// Takes a reference.
    pub(crate) fn inc_ref(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops a reference and returns the new count.
    pub(crate) fn dec_ref(&self) -> u32 {
        self.refcnt.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub(crate) fn pins(&self) -> u32 {
        self.pins.load(Ordering::Relaxed)
    }

    /// Takes a reference counted as a pin.
    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::Relaxed);
        self.inc_ref();
    }

    /// Drops a pin. Returns `false`, changing nothing, if there is none.
    pub(crate) fn unpin(&self) -> bool {
        if self.pins() == 0 {
            return false;
        }
        self.pins.fetch_sub(1, Ordering::Relaxed);
        self.dec_ref();
        true
    }

    /// Gives an unreferenced buffer a new identity with one reference.
    pub(crate) fn rebind(&self, id: BlockId) {
        debug_assert!(self.is_free());
        self.id.store(id.pack(), Ordering::Relaxed);
        self.bound.store(true, Ordering::Relaxed);
        self.valid.store(false, Ordering::Relaxed);
        self.refcnt.store(1, Ordering::Relaxed);
    }
}
