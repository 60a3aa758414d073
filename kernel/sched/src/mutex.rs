//! Blocking mutex core.
//!
//! Ownership state plus a wait list of blocked tasks. The kernel wrapper
//! around this raises the preemption lock, calls [`MutexCore::lock_begin`],
//! and yields when told to; on unlock, ownership transfers directly to the
//! head waiter under the raised preemption lock, so the woken task simply
//! observes itself as owner when it is next scheduled.

use crate::scheduler::{Scheduler, WaitList};
use crate::task::TaskId;

/// What the caller of [`MutexCore::lock_begin`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free; the current task now owns it.
    Acquired,
    /// The current task was queued; drop the preemption lock and yield.
    /// On resumption the task owns the mutex.
    MustYield,
}

/// Owner pointer plus wait list; the sharable-data wrapper lives in the
/// kernel crate.
pub struct MutexCore {
    owner: Option<TaskId>,
    waiters: WaitList,
}

impl MutexCore {
    /// Creates an unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: None,
            waiters: WaitList::new(),
        }
    }

    /// The current owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    /// Lock attempt by the current task. Must run with preemption raised.
    ///
    /// # Panics
    ///
    /// Panics if the current task already owns the mutex.
    pub fn lock_begin(&mut self, sched: &mut Scheduler) -> LockOutcome {
        let cur = sched.current().expect("no current task");
        assert!(self.owner != Some(cur), "mutex relock by its owner");

        if self.owner.is_none() {
            self.owner = Some(cur);
            LockOutcome::Acquired
        } else {
            sched.block_current_on(&mut self.waiters);
            LockOutcome::MustYield
        }
    }

    /// Unlock by the current task. Must run with preemption raised.
    ///
    /// With waiters present, ownership moves to the head waiter and the
    /// waiter is unblocked; there is no release window another task could
    /// race through.
    ///
    /// # Panics
    ///
    /// Panics if the current task is not the owner.
    pub fn unlock(&mut self, sched: &mut Scheduler) {
        let cur = sched.current().expect("no current task");
        assert_eq!(self.owner, Some(cur), "mutex unlock by non-owner");

        match sched.wait_pop(&mut self.waiters) {
            None => self.owner = None,
            Some(next_owner) => self.owner = Some(next_owner),
        }
    }
}

impl Default for MutexCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot(extra: usize) -> (Scheduler, Vec<TaskId>) {
        let mut sched = Scheduler::new();
        let idle = sched.allocate();
        sched.adopt_initial(idle);
        let tasks: Vec<TaskId> = (0..extra)
            .map(|_| {
                let t = sched.allocate();
                sched.link_task(t);
                t
            })
            .collect();
        (sched, tasks)
    }

    fn run_as(sched: &mut Scheduler, t: TaskId) {
        while sched.current() != Some(t) {
            sched.pick_next();
        }
    }

    #[test]
    fn uncontended_lock_unlock() {
        let (mut sched, tasks) = boot(1);
        let mut m = MutexCore::new();

        run_as(&mut sched, tasks[0]);
        assert_eq!(m.lock_begin(&mut sched), LockOutcome::Acquired);
        assert_eq!(m.owner(), Some(tasks[0]));
        m.unlock(&mut sched);
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn contended_handoff_is_direct() {
        let (mut sched, tasks) = boot(2);
        let (a, b) = (tasks[0], tasks[1]);
        let mut m = MutexCore::new();

        run_as(&mut sched, a);
        assert_eq!(m.lock_begin(&mut sched), LockOutcome::Acquired);

        run_as(&mut sched, b);
        assert_eq!(m.lock_begin(&mut sched), LockOutcome::MustYield);
        assert!(sched.task(b).is_blocked());
        // Mutual exclusion: still owned by a.
        assert_eq!(m.owner(), Some(a));

        run_as(&mut sched, a);
        m.unlock(&mut sched);
        // Ownership moved straight to the head waiter, which is runnable
        // again and observes itself as owner when scheduled.
        assert_eq!(m.owner(), Some(b));
        assert!(!sched.task(b).is_blocked());

        run_as(&mut sched, b);
        m.unlock(&mut sched);
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn waiters_acquire_in_fifo_order() {
        let (mut sched, tasks) = boot(3);
        let mut m = MutexCore::new();

        run_as(&mut sched, tasks[0]);
        m.lock_begin(&mut sched);
        for &t in &tasks[1..] {
            run_as(&mut sched, t);
            assert_eq!(m.lock_begin(&mut sched), LockOutcome::MustYield);
        }

        run_as(&mut sched, tasks[0]);
        m.unlock(&mut sched);
        assert_eq!(m.owner(), Some(tasks[1]));

        run_as(&mut sched, tasks[1]);
        m.unlock(&mut sched);
        assert_eq!(m.owner(), Some(tasks[2]));

        run_as(&mut sched, tasks[2]);
        m.unlock(&mut sched);
        assert_eq!(m.owner(), None);
    }

    #[test]
    #[should_panic(expected = "relock by its owner")]
    fn relock_asserts() {
        let (mut sched, tasks) = boot(1);
        let mut m = MutexCore::new();
        run_as(&mut sched, tasks[0]);
        m.lock_begin(&mut sched);
        m.lock_begin(&mut sched);
    }

    #[test]
    #[should_panic(expected = "unlock by non-owner")]
    fn foreign_unlock_asserts() {
        let (mut sched, tasks) = boot(2);
        let mut m = MutexCore::new();
        run_as(&mut sched, tasks[0]);
        m.lock_begin(&mut sched);
        run_as(&mut sched, tasks[1]);
        m.unlock(&mut sched);
    }
}
