//! Interrupt-safe lock.
//!
//! Saves the CPU interrupt flag and disables interrupts before acquiring
//! the inner lock; restores the previous interrupt state on release. This
//! prevents deadlocks when a lock is shared between interrupt handlers and
//! normal kernel code. On hosted builds (tests) the interrupt flag
//! manipulation compiles to nothing and only the mutual exclusion remains.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A lock that disables interrupts while held.
pub struct IntLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: Same reasoning as SpinLock — atomic ops ensure exclusive access.
unsafe impl<T: Send> Send for IntLock<T> {}
unsafe impl<T: Send> Sync for IntLock<T> {}

impl<T> IntLock<T> {
    /// Creates a new unlocked `IntLock`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts first.
    pub fn lock(&self) -> IntLockGuard<'_, T> {
        let saved_flags = save_flags_and_cli();

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IntLockGuard {
                    lock: self,
                    saved_flags,
                    _not_send: PhantomData,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<IntLockGuard<'_, T>> {
        let saved_flags = save_flags_and_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IntLockGuard {
                lock: self,
                saved_flags,
                _not_send: PhantomData,
            })
        } else {
            restore_flags(saved_flags);
            None
        }
    }
}

/// RAII guard that restores the saved interrupt state on drop.
///
/// `!Send`: interrupt state is per-CPU, so the guard must be released on
/// the CPU that created it.
pub struct IntLockGuard<'a, T> {
    lock: &'a IntLock<T>,
    saved_flags: u32,
    _not_send: PhantomData<*mut ()>,
}

impl<T> Deref for IntLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IntLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IntLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_flags(self.saved_flags);
    }
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
#[inline]
fn save_flags_and_cli() -> u32 {
    let flags: u32;
    // SAFETY: Reading EFLAGS and disabling interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "pushfd",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
#[inline]
fn restore_flags(flags: u32) {
    // Only re-enable if the Interrupt Flag was set before.
    if flags & (1 << 9) != 0 {
        // SAFETY: Restoring a previously observed interrupt state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86")))]
#[inline]
fn save_flags_and_cli() -> u32 {
    0
}

#[cfg(not(all(target_os = "none", target_arch = "x86")))]
#[inline]
fn restore_flags(_flags: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_release() {
        let lock = IntLock::new(7);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 7);
            assert!(lock.try_lock().is_none());
        }
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn mutate_through_guard() {
        let lock = IntLock::new(0u32);
        *lock.lock() += 5;
        assert_eq!(*lock.lock(), 5);
    }
}
