//! The blocking mutex.
//!
//! Wraps [`MutexCore`] around shared data. Contended lockers park on the
//! mutex's wait list and yield; the unlocker hands them ownership
//! directly under the preemption lock, so a woken task simply observes
//! itself as owner.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use tern_core::sync::IntLock;
use tern_core::sync::preempt;
use tern_sched::{LockOutcome, MutexCore};

use super::{SCHED, yield_now};

/// A mutual exclusion lock that blocks the calling task.
///
/// Must not be used from interrupt context.
pub struct Mutex<T> {
    core: IntLock<MutexCore>,
    data: UnsafeCell<T>,
}

// SAFETY: The mutex serializes access to the data; `T: Send` because the
// data moves between tasks.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex.
    pub const fn new(value: T) -> Self {
        Self {
            core: IntLock::new(MutexCore::new()),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, blocking the task while another owns it.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        preempt::assert_not_interrupt();

        preempt::up();
        let outcome = {
            let mut sched = SCHED.lock();
            let sched = sched.as_mut().expect("scheduler not initialized");
            self.core.lock().lock_begin(sched)
        };
        preempt::down();

        if outcome == LockOutcome::MustYield {
            // We stay blocked until the owner hands the mutex over; when
            // this returns, we are the owner.
            yield_now();
        }

        MutexGuard { mutex: self }
    }
}

/// RAII guard; unlocking hands ownership to the head waiter, if any.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Owning the mutex guarantees exclusive access.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Owning the mutex guarantees exclusive access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        preempt::assert_not_interrupt();

        preempt::up();
        {
            let mut sched = SCHED.lock();
            let sched = sched.as_mut().expect("scheduler not initialized");
            self.mutex.core.lock().unlock(sched);
        }
        preempt::down();
    }
}
