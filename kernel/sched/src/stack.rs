//! Kernel stack layout.
//!
//! Each task owns one 8 KiB-aligned kernel stack. The top of the region
//! holds the [`TaskInternal`] scratch area; below it sits the synthetic
//! [`InterruptFrame`](crate::frame::InterruptFrame) a fresh task starts
//! from, and one word below that the entry-function pointer the trampoline
//! reads. Because stacks are 8 KiB-aligned, the running task's internal
//! area is recovered by masking the stack pointer.

use crate::frame::{FRAME_SIZE, InterruptFrame};
use crate::task::TaskId;
use tern_core::static_assert;

/// Kernel stack size; also its alignment.
pub const STACK_SIZE: usize = 8192;

/// Per-task scratch area at the top of the kernel stack.
#[repr(C)]
pub struct TaskInternal {
    /// Downward cursor for scoped scratch hmem mappings. Zero means
    /// "top of the address space"; the first mapping wraps to the last
    /// page.
    pub hmem_end: u32,
    /// Handle of the task owning this stack.
    pub task: TaskId,
    _reserved: u16,
}

static_assert!(core::mem::size_of::<TaskInternal>() == 8);

/// Offset of [`TaskInternal`] within the stack region.
pub const INTERNAL_OFFSET: usize = STACK_SIZE - core::mem::size_of::<TaskInternal>();

/// Offset of the initial synthetic frame within the stack region.
pub const FRAME_OFFSET: usize = INTERNAL_OFFSET - FRAME_SIZE;

/// Offset of the entry-pointer word the trampoline reads.
pub const ENTRY_OFFSET: usize = FRAME_OFFSET - 4;

/// Returns the internal-area address for any stack pointer inside a task
/// stack, by masking down to the 8 KiB region base.
#[inline]
#[must_use]
pub const fn internal_from_sp(sp: usize) -> usize {
    (sp & !(STACK_SIZE - 1)) + INTERNAL_OFFSET
}

/// Lays out a fresh kernel stack and returns the initial saved stack
/// pointer (pointing at the synthetic frame).
///
/// # Safety
///
/// `stack_base` must point at `STACK_SIZE` bytes of owned, writable,
/// `STACK_SIZE`-aligned memory.
pub unsafe fn build_initial_stack(
    stack_base: usize,
    task: TaskId,
    entry: u32,
    trampoline_eip: u32,
    kernel_cs: u32,
    page_dir: u32,
) -> usize {
    debug_assert!(stack_base & (STACK_SIZE - 1) == 0, "stack misaligned");

    // SAFETY: All three writes land inside the owned stack region at
    // offsets below STACK_SIZE.
    unsafe {
        let internal = (stack_base + INTERNAL_OFFSET) as *mut TaskInternal;
        internal.write(TaskInternal {
            hmem_end: 0,
            task,
            _reserved: 0,
        });

        let frame = (stack_base + FRAME_OFFSET) as *mut InterruptFrame;
        frame.write(InterruptFrame::synthetic(trampoline_eip, kernel_cs, page_dir));

        let arg = (stack_base + ENTRY_OFFSET) as *mut u32;
        arg.write(entry);
    }

    stack_base + FRAME_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    #[test]
    fn layout_constants() {
        assert_eq!(INTERNAL_OFFSET, 8184);
        assert_eq!(FRAME_OFFSET, 8132);
        assert_eq!(ENTRY_OFFSET, 8128);
    }

    #[test]
    fn internal_recovery_by_masking() {
        let base = 0x0042_0000usize;
        for sp in [base, base + 1000, base + STACK_SIZE - 1] {
            assert_eq!(internal_from_sp(sp), base + INTERNAL_OFFSET);
        }
    }

    #[test]
    fn initial_stack_layout() {
        let layout = Layout::from_size_align(STACK_SIZE, STACK_SIZE).unwrap();
        // SAFETY: non-zero size.
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
        assert_ne!(base, 0);

        // SAFETY: base points at an owned aligned stack region.
        let sp = unsafe {
            build_initial_stack(base, TaskId(3), 0x1111_2222, 0x3333_4444, 0x08, 0x0050_0000)
        };
        assert_eq!(sp, base + FRAME_OFFSET);

        // SAFETY: reading back what build_initial_stack wrote.
        unsafe {
            let frame = &*(sp as *const InterruptFrame);
            assert_eq!(frame.eip, 0x3333_4444);
            assert_eq!(frame.cs, 0x08);
            assert_eq!(frame.cr3, 0x0050_0000);
            assert_eq!(frame.eflags, 0);

            let entry = ((base + ENTRY_OFFSET) as *const u32).read();
            assert_eq!(entry, 0x1111_2222);

            let internal = &*(internal_from_sp(sp) as *const TaskInternal);
            assert_eq!(internal.task, TaskId(3));
            assert_eq!(internal.hmem_end, 0);

            std::alloc::dealloc(base as *mut u8, layout);
        }
    }
}
