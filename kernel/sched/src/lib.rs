//! Task scheduling for the tern kernel.
//!
//! Round-robin over a circular runqueue with timer preemption and
//! voluntary yield. Tasks live in an arena indexed by [`TaskId`] handles;
//! each task record embeds two named link fields, one for the runqueue and
//! one for whatever wait list it may be blocked on. The blocking
//! [`MutexCore`] hands ownership directly to the head waiter on unlock.
//!
//! Context switching itself (synthetic frame, iret) is hardware code in
//! the kernel crate; everything here is state-machine logic that runs
//! under `cargo test` on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod frame;
pub mod mutex;
pub mod scheduler;
pub mod stack;
pub mod task;

pub use frame::InterruptFrame;
pub use mutex::{LockOutcome, MutexCore};
pub use scheduler::{Scheduler, WaitList};
pub use task::{LinkField, Task, TaskId};

use tern_core::sync::preempt;

/// Decides whether a timer tick may switch tasks: only when no preemption
/// lock is held and the tick is the only interrupt on the stack.
#[must_use]
pub fn should_preempt() -> bool {
    preempt::count() == 0 && preempt::interrupt_depth() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preemption_gate() {
        // Not in interrupt context at all: never preempt.
        assert!(!should_preempt());

        preempt::enter_interrupt();
        assert!(should_preempt());

        // A held preemption lock blocks the switch.
        {
            let _guard = preempt::PreemptGuard::new();
            assert!(!should_preempt());
        }
        assert!(should_preempt());

        // A nested interrupt blocks the switch.
        preempt::enter_interrupt();
        assert!(!should_preempt());
        preempt::leave_interrupt();

        preempt::leave_interrupt();
        assert!(!should_preempt());
    }
}
