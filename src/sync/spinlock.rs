//! Spin-wait lock.

use spin::{Mutex, MutexGuard};

/// A named spin lock.
///
/// Waiters busy-wait; critical sections must be short and must never block.
pub struct SpinLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

/// RAII guard for a held [`SpinLock`]. The lock is released on drop.
pub type SpinLockGuard<'a, T> = MutexGuard<'a, T>;

impl<T> SpinLock<T> {
    /// Creates an unlocked spin lock.
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(value),
        }
    }

    /// Spins until the lock is acquired.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.inner.lock()
    }

    /// Takes the lock only if it is free right now.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Returns whether some thread currently holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Returns the name given at construction.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> std::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}
