//! Scheduler wiring: stacks, context switches, preemption, task exit.
//!
//! The scheduling state machine lives in `tern-sched`; this module owns
//! the global instance and everything hardware-shaped around it: stack
//! construction, the timer hook, voluntary yield, the task trampoline,
//! and the stack-free-stack teardown that lets an exiting task free its
//! own stack from borrowed footing.

pub mod mutex;

use core::cell::UnsafeCell;

use tern_core::addr::{PhysAddr, VirtAddr};
use tern_core::paging::{PageFlags, PageTable, PageTableEntry};
use tern_core::sync::IntLock;
use tern_core::sync::preempt;

use tern_mm::layout::{Granule, SCRATCH_PDE};
use tern_sched::scheduler::Scheduler;
use tern_sched::stack::{ENTRY_OFFSET, INTERNAL_OFFSET, STACK_SIZE, TaskInternal, build_initial_stack, internal_from_sp};
use tern_sched::task::Task;
use tern_sched::{InterruptFrame, TaskId};

use crate::arch::x86::context;
use crate::arch::x86::gdt::{self, KERNEL_CS};
use crate::arch::x86::interrupts;
use crate::arch::x86::pic;
use crate::arch::x86::tlb;
use crate::config::IRQ_BASE_VECTOR;
use crate::mm;

pub use mutex::{Mutex, MutexGuard};

static SCHED: IntLock<Option<Scheduler>> = IntLock::new(None);

#[repr(C, align(4096))]
struct FreeStack(UnsafeCell<[u8; 4096]>);

// SAFETY: Only the single exiting task uses this stack, with preemption
// raised and interrupts disabled.
unsafe impl Sync for FreeStack {}

/// Dedicated stack an exiting task switches to so it can free its own.
static STACK_FREE_STACK: FreeStack = FreeStack(UnsafeCell::new([0; 4096]));

struct ExitContext {
    task: TaskId,
    stack_base: usize,
    next_sp: usize,
    next_esp0: u32,
}

static EXIT_CONTEXT: IntLock<Option<ExitContext>> = IntLock::new(None);

/// Runs a closure with the global scheduler.
///
/// # Panics
///
/// Panics before [`init`].
pub fn with_sched<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let mut sched = SCHED.lock();
    f(sched.as_mut().expect("scheduler not initialized"))
}

/// The internal area at the top of the running task's stack, recovered
/// by masking the stack pointer.
pub(crate) fn current_internal() -> *mut TaskInternal {
    let esp: usize;
    // SAFETY: Reading ESP has no side effects.
    unsafe { core::arch::asm!("mov {}, esp", out(reg) esp, options(nomem, nostack)) };
    internal_from_sp(esp) as *mut TaskInternal
}

fn idle_task() {
    loop {
        // SAFETY: hlt waits for the next interrupt; the timer wakes us.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

/// Creates the scheduler and its always-runnable idle task.
pub fn init() {
    *SCHED.lock() = Some(Scheduler::new());
    let idle = create_task(idle_task);
    with_sched(|sched| sched.adopt_initial(idle));
}

/// Allocates a task that will run `entry`: an 8 KiB kernel stack with
/// the internal area on top and a synthetic frame entering the
/// trampoline, plus a fresh address space.
///
/// The new task starts with one reference owned by the caller; linking
/// it adds the scheduler's.
pub fn create_task(entry: fn()) -> TaskId {
    preempt::assert_not_interrupt();

    let stack_base = mm::kmem_alloc(Granule::K8);
    let page_dir = mm::new_page_directory();
    let id = with_sched(Scheduler::allocate);

    #[allow(clippy::cast_possible_truncation)]
    // SAFETY: The stack is a fresh, owned, 8 KiB-aligned kmem block.
    let stack_pointer = unsafe {
        build_initial_stack(
            stack_base,
            id,
            entry as usize as u32,
            task_trampoline as usize as u32,
            u32::from(KERNEL_CS),
            page_dir.as_u32(),
        )
    };

    with_sched(|sched| {
        let task = sched.task_mut(id);
        task.stack_pointer = stack_pointer;
        task.stack_base = stack_base;
        task.page_dir = page_dir.as_u32();
    });
    id
}

/// Splices a task into the runqueue after the current one.
pub fn link_task(id: TaskId) {
    with_sched(|sched| sched.link_task(id));
}

#[allow(clippy::cast_possible_truncation)]
fn esp0_for(task: &Task) -> u32 {
    (task.stack_base + INTERNAL_OFFSET) as u32
}

/// Enters a task: publish its stack top for ring transitions, adopt its
/// frame, iret.
#[allow(clippy::cast_possible_truncation)]
fn enter(stack_pointer: usize, esp0: u32) -> ! {
    gdt::set_kernel_stack(esp0);
    // SAFETY: `stack_pointer` points at a valid saved frame.
    unsafe { context::asm_enter_task(stack_pointer as u32) }
}

/// Hands the CPU to the current task; never returns.
pub fn start() -> ! {
    interrupts::register_handler(IRQ_BASE_VECTOR as usize, timer_handler);

    let (sp, esp0) = with_sched(|sched| {
        let id = sched.current().expect("no initial task");
        let task = sched.task(id);
        (task.stack_pointer, esp0_for(task))
    });
    enter(sp, esp0)
}

fn timer_handler(frame: &mut InterruptFrame) {
    pic::end_of_interrupt(0);
    timeslice_passed(frame);
}

/// Timer tick: switch round-robin unless preemption is locked or the
/// tick interrupted another interrupt.
pub fn timeslice_passed(frame: &mut InterruptFrame) {
    if !tern_sched::should_preempt() {
        return;
    }

    let switch = {
        let mut guard = SCHED.lock();
        let Some(sched) = guard.as_mut() else {
            return;
        };
        let Some(current) = sched.current() else {
            return;
        };
        sched.task_mut(current).stack_pointer = core::ptr::from_mut(frame) as usize;
        let next = sched.pick_next();
        let task = sched.task(next);
        (task.stack_pointer, esp0_for(task))
    };

    // We leave through iret, not through the dispatcher epilogue, so the
    // nesting count must be settled here.
    preempt::leave_interrupt();
    enter(switch.0, switch.1)
}

/// Voluntarily gives up the CPU until the scheduler comes back around.
///
/// Must not be called from interrupt context, and requires the
/// preemption counter to be zero.
pub fn yield_now() {
    preempt::assert_not_interrupt();
    assert_eq!(preempt::count(), 0, "yield under a preemption lock");
    // SAFETY: Builds a synthetic frame for this call site and schedules;
    // execution resumes here when the task is picked again.
    unsafe { context::asm_yield() };
}

/// Called by `asm_yield` with the synthetic frame it built.
#[unsafe(no_mangle)]
extern "C" fn yield_with_frame(frame: *mut InterruptFrame) -> ! {
    let (sp, esp0) = with_sched(|sched| {
        let current = sched.current().expect("yield without a current task");
        sched.task_mut(current).stack_pointer = frame as usize;
        let next = sched.pick_next();
        let task = sched.task(next);
        (task.stack_pointer, esp0_for(task))
    });
    enter(sp, esp0)
}

/// First code of every task, entered through the synthetic frame with
/// interrupts disabled.
extern "C" fn task_trampoline() -> ! {
    // Give this address space its scratch page table before anything can
    // take a scoped hmem mapping.
    let table = mm::kmem_alloc(Granule::K4) as *mut PageTable;
    // SAFETY: Fresh kmem page; CR3 points at this task's directory.
    unsafe {
        (*table).zero();
        let pd = &mut *tlb::read_cr3().to_virt().as_mut_ptr::<PageTable>();
        #[allow(clippy::cast_possible_truncation)]
        let table_phys = PhysAddr::from_kmem(VirtAddr::new(table as u32));
        pd.entries[SCRATCH_PDE] =
            PageTableEntry::new(table_phys, PageFlags::PRESENT | PageFlags::WRITE);
    }

    // The entry pointer sits one word below the initial frame.
    let stack_base = current_internal() as usize & !(STACK_SIZE - 1);
    // SAFETY: `create_task` wrote a valid function pointer there.
    let entry: fn() = unsafe {
        core::mem::transmute(((stack_base + ENTRY_OFFSET) as *const u32).read() as usize)
    };

    interrupts::enable();
    entry();
    task_exit()
}

/// Tears down the finished task: unlink, drop the scheduler reference,
/// then continue on the dedicated stack so our own stack can be freed.
#[allow(clippy::cast_possible_truncation)]
fn task_exit() -> ! {
    preempt::up();
    interrupts::disable();

    // SAFETY: Still on our own stack; the internal area is live.
    let my = unsafe { (*current_internal()).task };
    let (next_sp, next_esp0, stack_base) = with_sched(|sched| {
        let stack_base = sched.task(my).stack_base;
        let (next, _) = sched.remove_current();
        let task = sched.task(next);
        (task.stack_pointer, esp0_for(task), stack_base)
    });

    *EXIT_CONTEXT.lock() = Some(ExitContext {
        task: my,
        stack_base,
        next_sp,
        next_esp0,
    });

    let free_top = STACK_FREE_STACK.0.get() as usize + 4096;
    // SAFETY: The free stack is owned and unused; interrupts are off and
    // preemption is raised, so nothing else can claim it.
    unsafe { context::asm_switch_stack_and_call(free_top as u32, finish_task_exit, 0) }
}

/// Runs on the stack-free stack: releases the dead task's stack and
/// record, then enters the next task.
unsafe extern "C" fn finish_task_exit(_arg: u32) -> ! {
    let ctx = EXIT_CONTEXT
        .lock()
        .take()
        .expect("task exit without context");

    mm::kmem_free(Granule::K8, ctx.stack_base);
    with_sched(|sched| {
        if sched.release_ref(ctx.task) {
            sched.free_task(ctx.task);
        }
    });

    preempt::down();
    enter(ctx.next_sp, ctx.next_esp0)
}
