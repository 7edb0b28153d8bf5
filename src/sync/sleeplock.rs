//! Blocking exclusive lock.
//!
//! A sleep lock is held across long operations (disk transfers) so waiters
//! block instead of spinning. It records which thread holds it so callers
//! can assert ownership with [`SleepLock::holding`].

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// A blocking lock that protects a `T` and tracks its holder.
pub struct SleepLock<T> {
    name: &'static str,
    /// Holder of the lock, `None` when free.
    holder: Mutex<Option<ThreadId>>,
    wakeup: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `holder`; at most one guard
// exists at a time, exactly like `std::sync::Mutex`.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for SleepLock<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// Creates an unlocked sleep lock.
    pub fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            holder: Mutex::new(None),
            wakeup: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Blocks until the lock is free, then takes it.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let me = thread::current().id();
        let mut holder = self.holder.lock();
        while holder.is_some() {
            self.wakeup.wait(&mut holder);
        }
        *holder = Some(me);
        SleepLockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns whether the calling thread holds the lock.
    #[must_use]
    pub fn holding(&self) -> bool {
        *self.holder.lock() == Some(thread::current().id())
    }

    /// Returns whether any thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }

    /// Returns the name given at construction.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn unlock(&self) {
        let mut holder = self.holder.lock();
        *holder = None;
        self.wakeup.notify_one();
    }
}

impl<T> std::fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SleepLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard for a held [`SleepLock`].
///
/// The guard may move to another thread; the lock then stays held but
/// [`SleepLock::holding`] is false on the new thread.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<T> SleepLockGuard<'_, T> {
    /// Returns whether the calling thread is the one that took the lock.
    #[must_use]
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    #[allow(unsafe_code)]
    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    #[allow(unsafe_code)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists only while the lock is held, and `&mut self`
        // rules out any other borrow through this guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_holding() {
        let lock = SleepLock::new([0u8; 4], "buffer");
        assert!(!lock.holding());
        let mut guard = lock.lock();
        guard[0] = 7;
        assert!(lock.holding());
        assert!(guard.holding());
        drop(guard);
        assert!(!lock.holding());
        assert!(!lock.is_locked());
        assert_eq!(lock.lock()[0], 7);
    }

    #[test]
    fn test_not_holding_from_other_thread() {
        let lock = Arc::new(SleepLock::new(0u32, "buffer"));
        let _guard = lock.lock();

        let other = Arc::clone(&lock);
        let (held_elsewhere, locked) =
            thread::spawn(move || (other.holding(), other.is_locked()))
                .join()
                .unwrap();
        assert!(!held_elsewhere);
        assert!(locked);
    }

    #[test]
    fn test_guard_moved_to_other_thread() {
        let lock = SleepLock::new(0u32, "buffer");
        let guard = lock.lock();
        thread::scope(|s| {
            s.spawn(move || {
                assert!(!guard.holding());
                drop(guard);
            });
        });
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_blocks_until_released() {
        let lock = Arc::new(SleepLock::new(0u32, "buffer"));
        let acquired = Arc::new(AtomicBool::new(false));

        let guard = lock.lock();
        let waiter = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let mut g = lock.lock();
                *g += 1;
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(*lock.lock(), 1);
    }
}
