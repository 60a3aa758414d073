//! Control-register access and TLB invalidation.

use tern_core::addr::PhysAddr;

/// Invalidates the TLB entry covering `virt`.
#[inline]
pub fn invlpg(virt: usize) {
    // SAFETY: invlpg only drops a cached translation.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
    }
}

/// Reads the current page-directory physical address.
#[inline]
#[must_use]
pub fn read_cr3() -> PhysAddr {
    let value: u32;
    // SAFETY: Reading CR3 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    PhysAddr::new(value).align_page_down()
}

/// Loads a new page directory, flushing the TLB.
///
/// # Safety
///
/// `dir` must be the physical address of a valid page directory mapping
/// the currently executing code.
#[inline]
pub unsafe fn write_cr3(dir: PhysAddr) {
    // SAFETY: Contract forwarded to the caller.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) dir.as_u32(), options(nostack, preserves_flags));
    }
}

/// Reads the faulting address after a page fault.
#[inline]
#[must_use]
pub fn read_cr2() -> u32 {
    let value: u32;
    // SAFETY: Reading CR2 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}
