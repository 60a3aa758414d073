//! Preemption and interrupt-context bookkeeping.
//!
//! The preemption counter is process-wide: a timer tick whose handler
//! observes a non-zero counter returns without switching tasks. The
//! interrupt-nesting counter is maintained by the interrupt dispatcher and
//! lets code assert it is not running in interrupt context.
//!
//! Counter updates use sequentially consistent atomics.

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

static PREEMPT_COUNT: AtomicU32 = AtomicU32::new(0);
static INTERRUPT_DEPTH: AtomicI32 = AtomicI32::new(0);

/// Returns the current preemption-lock nesting count.
#[inline]
#[must_use]
pub fn count() -> u32 {
    PREEMPT_COUNT.load(Ordering::SeqCst)
}

/// Increments the preemption counter.
///
/// Prefer the scoped [`PreemptGuard`]; this is exposed for the few places
/// that hand a raised counter across a context switch.
pub fn up() {
    PREEMPT_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Decrements the preemption counter.
///
/// # Panics
///
/// Panics on underflow.
pub fn down() {
    let old = PREEMPT_COUNT.fetch_sub(1, Ordering::SeqCst);
    assert!(old != 0, "preemption counter underflow");
}

/// Scoped preemption lock: raises the counter for its lifetime.
///
/// May be nested freely. Must not be constructed in interrupt context when
/// the protected section can yield.
pub struct PreemptGuard(());

impl PreemptGuard {
    /// Raises the preemption counter.
    #[must_use]
    pub fn new() -> Self {
        up();
        Self(())
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        down();
    }
}

/// Records entry into an interrupt handler. Called by the dispatcher only.
pub fn enter_interrupt() {
    INTERRUPT_DEPTH.fetch_add(1, Ordering::SeqCst);
}

/// Records exit from an interrupt handler.
///
/// Also called by the scheduler before it switches away from an interrupt
/// frame, since the dispatcher epilogue will not run for that frame.
///
/// # Panics
///
/// Panics if the depth would go negative.
pub fn leave_interrupt() {
    let new = INTERRUPT_DEPTH.fetch_sub(1, Ordering::SeqCst) - 1;
    assert!(new >= 0, "interrupt depth underflow");
}

/// Returns the current interrupt-nesting depth.
#[inline]
#[must_use]
pub fn interrupt_depth() -> i32 {
    INTERRUPT_DEPTH.load(Ordering::SeqCst)
}

/// Returns `true` while any interrupt handler is on the stack.
#[inline]
#[must_use]
pub fn in_interrupt() -> bool {
    interrupt_depth() != 0
}

/// Asserts the caller is not running in interrupt context.
///
/// APIs that take locks which can yield, or that require a current task
/// (scratch hmem mappings), call this on entry.
#[inline]
pub fn assert_not_interrupt() {
    assert!(!in_interrupt(), "forbidden in interrupt context");
}

#[cfg(test)]
mod tests {
    use super::*;

    // The counters are process globals, so exercise them from one test to
    // avoid interference between parallel test threads.
    #[test]
    fn counters() {
        let base = count();
        {
            let _g = PreemptGuard::new();
            assert_eq!(count(), base + 1);
            {
                let _g2 = PreemptGuard::new();
                assert_eq!(count(), base + 2);
            }
            assert_eq!(count(), base + 1);
        }
        assert_eq!(count(), base);

        assert!(!in_interrupt());
        enter_interrupt();
        assert!(in_interrupt());
        assert_eq!(interrupt_depth(), 1);
        leave_interrupt();
        assert!(!in_interrupt());
    }
}
