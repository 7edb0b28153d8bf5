//! Error types for kcore.
//!
//! There are two tiers. [`KernelError`] is an ordinary, recoverable error
//! returned through [`Result`]. [`KernelPanic`] is an invariant violation
//! that halts the kernel: it is never returned, only raised through [`halt`].

use thiserror::Error;

use crate::memory::PhysAddr;

/// Result type alias using [`KernelError`].
pub type Result<T> = std::result::Result<T, KernelError>;

/// Recoverable errors reported to the caller.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Invalid pool geometry or physical memory layout.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Backing storage for a block device could not be set up.
    #[error("Storage error: {0}")]
    StorageError(String),
}

/// Unrecoverable invariant violations.
///
/// These are raised by [`halt`] as the panic payload. An embedding system
/// treats any unwind carrying a `KernelPanic` as a kernel halt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelPanic {
    /// `write` called on a buffer whose sleep lock the caller does not hold.
    #[error("bwrite: buffer {slot} not locked by caller")]
    WriteWithoutLock { slot: usize },

    /// `release` called on a buffer whose sleep lock the caller does not hold.
    #[error("brelse: buffer {slot} not locked by caller")]
    ReleaseWithoutLock { slot: usize },

    /// A buffer handle was passed to a cache that did not issue it.
    #[error("bcache: buffer {slot} belongs to another cache")]
    ForeignBuffer { slot: usize },

    /// `unpin` with no outstanding pin to drop.
    #[error("bunpin: buffer {slot} has no outstanding pin")]
    UnpinWithoutPin { slot: usize },

    /// Every buffer in every bucket is referenced.
    #[error("bget: no buffers for dev {dev} block {blockno}")]
    NoBuffers { dev: u32, blockno: u32 },

    /// Freed address is misaligned or outside the managed range.
    #[error("kfree: bad page address {addr}")]
    BadFree { addr: PhysAddr },

    /// A page handle was freed to an allocator that did not issue it.
    #[error("kfree: page {addr} belongs to another allocator")]
    ForeignPage { addr: PhysAddr },

    /// The calling thread runs on a core the allocator does not know about.
    #[error("cpuid: core {core} out of range (ncpu {ncpu})")]
    CoreOutOfRange { core: usize, ncpu: usize },

    /// A thread tried to change cores with preemption disabled.
    #[error("sched: migration with preemption disabled")]
    MigrateWhilePinned,

    /// More preemption enables than disables.
    #[error("pop_off: preemption counter underflow")]
    PreemptUnderflow,

    /// The block device failed a transfer it has no way to report.
    #[error("disk: transfer failed for dev {dev} block {blockno}: {reason}")]
    DiskFailure {
        dev: u32,
        blockno: u32,
        reason: String,
    },
}

/// Halts on an invariant violation.
///
/// Logs the reason and unwinds with the [`KernelPanic`] as payload. Lock
/// guards held by the caller are released during the unwind.
#[cold]
#[track_caller]
pub fn halt(reason: KernelPanic) -> ! {
    tracing::error!(%reason, "kernel halt");
    std::panic::panic_any(reason)
}
