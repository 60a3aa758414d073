//! Synchronization primitives.
//!
//! Three layers, matching the kernel's concurrency model:
//!
//! - [`SpinLock`]: plain test-and-test-and-set mutual exclusion.
//! - [`IntLock`]: mutual exclusion with CPU interrupts disabled while held.
//!   Protects state shared with interrupt handlers (page allocator, slab
//!   free lists, inode caches).
//! - [`preempt`]: the process-wide preemption counter and scoped
//!   [`PreemptGuard`](preempt::PreemptGuard). Protects the runqueue and
//!   mutex wait lists from the timer.

mod intlock;
pub mod preempt;
mod spinlock;

pub use intlock::{IntLock, IntLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
