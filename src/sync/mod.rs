//! Lock primitives.
//!
//! - [`SpinLock`]: busy-waiting mutual exclusion for short metadata updates
//!   (cache buckets, the steal lock, per-core free lists)
//! - [`SleepLock`]: blocking exclusive lock that can report whether the
//!   calling thread holds it (buffer payloads)

mod sleeplock;
mod spinlock;

pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
