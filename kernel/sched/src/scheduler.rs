//! The task arena, the runqueue, and wait lists.
//!
//! Tasks are arena slots addressed by [`TaskId`]; the runqueue is a
//! circular list threaded through each task's `Run` link, and wait lists
//! are circles threaded through the `Block` link with an external head.
//! `pick_next` advances round-robin, skipping any task whose `Block` link
//! is engaged. The always-runnable idle task guarantees the walk
//! terminates.

use alloc::vec::Vec;

use crate::task::{Link, LinkField, PID_LIMIT, Task, TaskId};

/// Head of a wait list (e.g. a mutex's blocked tasks).
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitList {
    head: Option<TaskId>,
}

impl WaitList {
    /// An empty wait list.
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Returns `true` when nobody waits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// The scheduler state: task arena, runqueue, pid counter.
pub struct Scheduler {
    slots: Vec<Option<Task>>,
    free_slots: Vec<u16>,
    current: Option<TaskId>,
    next_pid: u32,
}

impl Scheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            current: None,
            next_pid: 0,
        }
    }

    /// The currently running task, once the scheduler has started.
    #[must_use]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// Shared access to a task record.
    ///
    /// # Panics
    ///
    /// Panics on a stale handle.
    #[must_use]
    pub fn task(&self, id: TaskId) -> &Task {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale task handle")
    }

    /// Exclusive access to a task record.
    ///
    /// # Panics
    ///
    /// Panics on a stale handle.
    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale task handle")
    }

    // -- lifecycle ---------------------------------------------------------

    /// Creates a task record with refcount 1 and a fresh pid.
    ///
    /// The caller fills in the stack and page directory before linking.
    ///
    /// # Panics
    ///
    /// Panics when the pid space is exhausted.
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate(&mut self) -> TaskId {
        let pid = self.next_pid;
        assert!(pid < PID_LIMIT, "out of pids");
        self.next_pid += 1;

        let task = Task::new(pid);
        if let Some(slot) = self.free_slots.pop() {
            debug_assert!(self.slots[slot as usize].is_none());
            self.slots[slot as usize] = Some(task);
            TaskId(slot)
        } else {
            self.slots.push(Some(task));
            TaskId((self.slots.len() - 1) as u16)
        }
    }

    /// Adds one reference.
    pub fn take_ref(&mut self, id: TaskId) {
        let task = self.task_mut(id);
        debug_assert!(task.refcount > 0);
        task.refcount += 1;
    }

    /// Drops one reference; returns `true` when it was the last.
    pub fn release_ref(&mut self, id: TaskId) -> bool {
        let task = self.task_mut(id);
        assert!(task.refcount > 0, "refcount underflow");
        task.refcount -= 1;
        task.refcount == 0
    }

    /// Reference count, exposed for lifecycle assertions.
    #[must_use]
    pub fn refcount(&self, id: TaskId) -> u32 {
        self.task(id).refcount
    }

    /// Frees a task record whose refcount has reached zero.
    ///
    /// # Panics
    ///
    /// Panics if the task is still referenced or still on a list.
    pub fn free_task(&mut self, id: TaskId) {
        {
            let task = self.task(id);
            assert_eq!(task.refcount, 0, "freeing a referenced task");
            assert!(!task.run.is_linked(), "freeing a queued task");
            assert!(!task.block.is_linked(), "freeing a blocked task");
        }
        self.slots[id.0 as usize] = None;
        self.free_slots.push(id.0);
    }

    // -- circular list plumbing --------------------------------------------

    fn link(&self, field: LinkField, id: TaskId) -> Link {
        self.task(id).link(field)
    }

    /// Returns `true` while `id` is on some list through `field`.
    #[must_use]
    pub fn is_linked(&self, field: LinkField, id: TaskId) -> bool {
        self.link(field, id).is_linked()
    }

    /// Splices `new` into the circle right after `at`. `at` may be alone
    /// (unlinked), which forms a two-element circle.
    fn link_after(&mut self, field: LinkField, at: TaskId, new: TaskId) {
        debug_assert!(!self.is_linked(field, new), "task already linked");
        debug_assert!(at != new);

        let at_link = self.link(field, at);
        let after = at_link.next.unwrap_or(at);

        *self.task_mut(new).link_mut(field) = Link {
            prev: Some(at),
            next: Some(after),
        };
        self.task_mut(at).link_mut(field).next = Some(new);
        if after == at {
            self.task_mut(at).link_mut(field).prev = Some(new);
        } else {
            self.task_mut(after).link_mut(field).prev = Some(new);
        }
    }

    /// Removes `id` from its circle and resets the link.
    fn unlink(&mut self, field: LinkField, id: TaskId) {
        let link = self.link(field, id);
        let (Some(prev), Some(next)) = (link.prev, link.next) else {
            return;
        };
        if prev != id {
            self.task_mut(prev).link_mut(field).next = Some(next);
            self.task_mut(next).link_mut(field).prev = Some(prev);
        }
        *self.task_mut(id).link_mut(field) = Link::default();
    }

    /// Next task in the runqueue circle after `id`.
    fn next_running(&self, id: TaskId) -> TaskId {
        self.link(LinkField::Run, id)
            .next
            .expect("task not on the runqueue")
    }

    // -- runqueue ----------------------------------------------------------

    /// Installs the first task: sole runqueue element and current. Takes
    /// the scheduler reference like [`link_task`](Self::link_task).
    pub fn adopt_initial(&mut self, id: TaskId) {
        assert!(self.current.is_none(), "scheduler already running");
        self.take_ref(id);
        *self.task_mut(id).link_mut(LinkField::Run) = Link {
            prev: Some(id),
            next: Some(id),
        };
        self.current = Some(id);
    }

    /// Adds one reference and splices the task into the runqueue right
    /// after the currently running task.
    pub fn link_task(&mut self, id: TaskId) {
        let cur = self.current.expect("scheduler not started");
        self.take_ref(id);
        self.link_after(LinkField::Run, cur, id);
    }

    /// Removes a task from the runqueue and drops the scheduler
    /// reference; returns `true` when that was the last reference.
    pub fn unlink_task(&mut self, id: TaskId) -> bool {
        self.unlink(LinkField::Run, id);
        self.release_ref(id)
    }

    /// Round-robin selection: advances past the current task, skipping
    /// every task whose blocking subsystem is engaged.
    ///
    /// # Panics
    ///
    /// Panics if a full traversal finds nothing runnable (the idle task
    /// must always be runnable).
    pub fn pick_next(&mut self) -> TaskId {
        let cur = self.current.expect("scheduler not started");
        let mut candidate = self.next_running(cur);
        let mut steps = self.slots.len() + 1;
        while self.is_linked(LinkField::Block, candidate) {
            candidate = self.next_running(candidate);
            steps -= 1;
            assert!(steps > 0, "no runnable task on the runqueue");
        }
        self.current = Some(candidate);
        candidate
    }

    /// Exit path: picks the next runnable task, then unlinks the old
    /// current and drops its scheduler reference. Returns the new current
    /// and whether the old task's refcount reached zero.
    pub fn remove_current(&mut self) -> (TaskId, bool) {
        let old = self.current.expect("scheduler not started");
        let next = self.pick_next();
        assert!(next != old, "last task cannot exit");
        self.unlink(LinkField::Run, old);
        let last = self.release_ref(old);
        (next, last)
    }

    // -- wait lists --------------------------------------------------------

    /// Appends the current task to a wait list (blocks it).
    pub fn block_current_on(&mut self, list: &mut WaitList) {
        let cur = self.current.expect("scheduler not started");
        debug_assert!(!self.is_linked(LinkField::Block, cur), "already blocked");

        match list.head {
            None => {
                *self.task_mut(cur).link_mut(LinkField::Block) = Link {
                    prev: Some(cur),
                    next: Some(cur),
                };
                list.head = Some(cur);
            }
            Some(head) => {
                // Append at the tail: the element before the head.
                let tail = self
                    .link(LinkField::Block, head)
                    .prev
                    .expect("wait list head unlinked");
                self.link_after(LinkField::Block, tail, cur);
            }
        }
    }

    /// Pops and unblocks the head waiter.
    pub fn wait_pop(&mut self, list: &mut WaitList) -> Option<TaskId> {
        let head = list.head?;
        let next = self
            .link(LinkField::Block, head)
            .next
            .expect("wait list head unlinked");
        self.unlink(LinkField::Block, head);
        list.head = if next == head { None } else { Some(next) };
        Some(head)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Boots a scheduler with an idle task plus `extra` linked tasks.
    /// Returns (scheduler, idle, tasks).
    fn boot(extra: usize) -> (Scheduler, TaskId, Vec<TaskId>) {
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
        (sched, idle, tasks)
    }

    #[test]
    fn pids_are_monotonic() {
        let mut sched = Scheduler::new();
        let a = sched.allocate();
        let b = sched.allocate();
        assert_eq!(sched.task(a).pid, 0);
        assert_eq!(sched.task(b).pid, 1);
    }

    #[test]
    fn round_robin_covers_every_task() {
        let (mut sched, idle, tasks) = boot(3);
        // link_task splices after current, so the circle runs newest first.
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(sched.pick_next());
        }
        assert_eq!(seen.len(), 4);
        assert!(seen.contains(&idle));
        for t in &tasks {
            assert!(seen.contains(t), "{t:?} never scheduled");
        }
        // One full traversal returns to the start.
        assert_eq!(sched.pick_next(), seen[0]);
    }

    #[test]
    fn blocked_tasks_are_skipped() {
        let (mut sched, idle, tasks) = boot(2);
        let mut list = WaitList::new();

        // Walk until `tasks[0]` is current, then block it.
        while sched.current() != Some(tasks[0]) {
            sched.pick_next();
        }
        sched.block_current_on(&mut list);
        assert!(sched.task(tasks[0]).is_blocked());

        for _ in 0..6 {
            let picked = sched.pick_next();
            assert_ne!(picked, tasks[0], "blocked task was scheduled");
        }

        // Unblock and observe it runs again within one traversal.
        let woken = sched.wait_pop(&mut list).unwrap();
        assert_eq!(woken, tasks[0]);
        let mut found = false;
        for _ in 0..4 {
            found |= sched.pick_next() == tasks[0];
        }
        assert!(found);
        let _ = idle;
    }

    #[test]
    fn wait_list_is_fifo() {
        let (mut sched, _idle, tasks) = boot(3);
        let mut list = WaitList::new();

        for &t in &tasks {
            while sched.current() != Some(t) {
                sched.pick_next();
            }
            sched.block_current_on(&mut list);
        }
        assert_eq!(sched.wait_pop(&mut list), Some(tasks[0]));
        assert_eq!(sched.wait_pop(&mut list), Some(tasks[1]));
        assert_eq!(sched.wait_pop(&mut list), Some(tasks[2]));
        assert_eq!(sched.wait_pop(&mut list), None);
        assert!(list.is_empty());
    }

    #[test]
    fn lifecycle_refcounts() {
        let (mut sched, idle, _) = boot(0);
        let t = sched.allocate();
        assert_eq!(sched.refcount(t), 1);
        sched.link_task(t);
        assert_eq!(sched.refcount(t), 2);

        // Exit: switch focus to the task, then remove it.
        while sched.current() != Some(t) {
            sched.pick_next();
        }
        let (next, last) = sched.remove_current();
        assert_eq!(next, idle);
        assert!(!last, "creator still holds a reference");
        assert!(sched.release_ref(t), "last reference");
        sched.free_task(t);

        // The slot is reused by the next allocation.
        let again = sched.allocate();
        assert_eq!(again.0, t.0);
    }

    #[test]
    #[should_panic(expected = "no runnable task")]
    fn all_blocked_panics() {
        let (mut sched, _idle, _) = boot(0);
        let mut list = WaitList::new();
        // Blocking the only task leaves nothing runnable.
        sched.block_current_on(&mut list);
        sched.pick_next();
    }
}
