//! Scoped scratch hmem mappings.
//!
//! Every task owns the last page-directory entry: one page table whose
//! 1024 slots are pushed and popped like a stack through the task's
//! `hmem_end` cursor. A mapping lives for the scope of the guard and
//! must unwind in construction order, which the cursor asserts.

use tern_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use tern_core::paging::{PageFlags, PageTable, PageTableEntry};
use tern_core::sync::preempt;

use tern_mm::hmem::ScratchMapper;
use tern_mm::layout::SCRATCH_PDE;

use crate::arch::x86::tlb;
use crate::sched;

/// A temporary kernel mapping of one physical page.
pub struct ScopedHmemMapping {
    virt: usize,
}

impl ScopedHmemMapping {
    /// Maps `phys` into the current task's scratch window.
    ///
    /// # Panics
    ///
    /// Panics in interrupt context (there is no current task) and when
    /// the 1024-slot window is exhausted.
    #[must_use]
    pub fn new(phys: PhysAddr) -> Self {
        preempt::assert_not_interrupt();

        let internal = sched::current_internal();
        // SAFETY: The internal area lives at the top of the current
        // task's stack; only this task touches it.
        let virt = unsafe {
            let next = (*internal).hmem_end.wrapping_sub(PAGE_SIZE);
            (*internal).hmem_end = next;
            next as usize
        };

        let va = VirtAddr::new(virt as u32);
        assert_eq!(va.dir_index(), SCRATCH_PDE, "scratch window exhausted");

        // SAFETY: CR3 points at this task's directory; the trampoline
        // installed the scratch page table before the task body ran.
        unsafe {
            let pd = &*tlb::read_cr3().to_virt().as_ptr::<PageTable>();
            let pde = pd.entries[SCRATCH_PDE];
            assert!(pde.is_present(), "scratch page table missing");
            let table = &mut *pde.addr().to_virt().as_mut_ptr::<PageTable>();
            table.entries[va.table_index()] =
                PageTableEntry::new(phys, PageFlags::PRESENT | PageFlags::WRITE);
        }
        // The slot may have carried an earlier mapping.
        tlb::invlpg(virt);

        Self { virt }
    }

    /// The mapped address.
    #[must_use]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.virt as *mut T
    }
}

impl Drop for ScopedHmemMapping {
    fn drop(&mut self) {
        let internal = sched::current_internal();
        // SAFETY: Same single-task access as in `new`.
        unsafe {
            assert_eq!(
                (*internal).hmem_end as usize,
                self.virt,
                "scratch mappings must unwind in LIFO order"
            );
            (*internal).hmem_end = (*internal).hmem_end.wrapping_add(PAGE_SIZE);
        }
    }
}

/// [`ScratchMapper`] implementation over the scoped mapping.
pub struct TaskScratchMapper;

impl ScratchMapper for TaskScratchMapper {
    fn with_mapping<R>(&self, phys: PhysAddr, f: impl FnOnce(*mut u32) -> R) -> R {
        let mapping = ScopedHmemMapping::new(phys);
        f(mapping.as_mut_ptr())
    }
}
