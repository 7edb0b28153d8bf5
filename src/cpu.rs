//! Simulated execution cores.
//!
//! Every thread runs on some core (core 0 until told otherwise). A
//! [`PreemptGuard`] pins the thread to its core: while one is live the
//! thread cannot migrate, so a core id read through the guard stays valid
//! for as long as the guard does.

use std::cell::Cell;
use std::marker::PhantomData;

use crate::error::{halt, KernelPanic};

thread_local! {
    static CURRENT_CORE: Cell<usize> = const { Cell::new(0) };
    /// Depth of nested `push_off` calls.
    static NOFF: Cell<u32> = const { Cell::new(0) };
}

/// Places the calling thread on `core`.
///
/// This is the scheduler's side of the contract. Halts if the thread has
/// preemption disabled.
pub fn set_current_core(core: usize) {
    if NOFF.with(Cell::get) > 0 {
        halt(KernelPanic::MigrateWhilePinned);
    }
    CURRENT_CORE.with(|c| c.set(core));
}

/// Disables preemption for the calling thread until the guard drops.
///
/// Calls nest; preemption comes back when the outermost guard drops.
#[must_use = "preemption is re-enabled as soon as the guard drops"]
pub fn push_off() -> PreemptGuard {
    NOFF.with(|n| n.set(n.get() + 1));
    PreemptGuard {
        _not_send: PhantomData,
    }
}

/// Returns whether the calling thread has preemption disabled.
#[must_use]
pub fn preemption_disabled() -> bool {
    NOFF.with(Cell::get) > 0
}

/// Proof that preemption is disabled on this thread.
///
/// Not `Send`: the guard belongs to the thread that created it.
pub struct PreemptGuard {
    _not_send: PhantomData<*const ()>,
}

impl PreemptGuard {
    /// Returns the id of the core this thread is running on.
    #[must_use]
    pub fn core_id(&self) -> usize {
        CURRENT_CORE.with(Cell::get)
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        NOFF.with(|n| {
            let depth = n.get();
            if depth == 0 {
                halt(KernelPanic::PreemptUnderflow);
            }
            n.set(depth - 1);
        });
    }
}
