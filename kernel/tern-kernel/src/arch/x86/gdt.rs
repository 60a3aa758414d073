//! Flat segmentation: GDT encoding, selectors, and the TSS.
//!
//! Six descriptors: null, kernel code/data, user code/data, TSS. The
//! only TSS field that matters is `esp0`/`ss0`, loaded by the CPU on
//! ring-3 to ring-0 transitions; the scheduler rewrites `esp0` on every
//! task entry.

/// Kernel code segment selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_DS: u16 = 0x10;
/// User code segment selector (RPL 3).
pub const USER_CS: u16 = 0x1B;
/// User data segment selector (RPL 3).
pub const USER_DS: u16 = 0x23;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x28;

/// Encodes one 8-byte segment descriptor.
///
/// `limit` is 20 bits; `flags` is the high nibble of byte 6
/// (granularity, size).
#[must_use]
pub const fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | (base & 0xFF_FFFF) << 16
        | (access as u64) << 40
        | (limit & 0xF_0000) << 32
        | ((flags & 0xF) as u64) << 52
        | (base & 0xFF00_0000) << 32
}

/// A flat 4 GiB code segment descriptor for the given DPL.
#[must_use]
pub const fn code_segment(dpl: u8) -> u64 {
    descriptor(0, 0xF_FFFF, 0x9A | (dpl & 3) << 5, 0xC)
}

/// A flat 4 GiB data segment descriptor for the given DPL.
#[must_use]
pub const fn data_segment(dpl: u8) -> u64 {
    descriptor(0, 0xF_FFFF, 0x92 | (dpl & 3) << 5, 0xC)
}

/// The 32-bit task state segment.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TaskStateSegment {
    /// Previous task link; unused with software switching.
    pub prev_tss: u32,
    /// Stack pointer loaded when entering ring 0.
    pub esp0: u32,
    /// Stack segment loaded when entering ring 0.
    pub ss0: u32,
    /// The remaining fields are unused by this kernel.
    pub esp1: u32,
    #[allow(missing_docs)]
    pub ss1: u32,
    #[allow(missing_docs)]
    pub esp2: u32,
    #[allow(missing_docs)]
    pub ss2: u32,
    #[allow(missing_docs)]
    pub cr3: u32,
    #[allow(missing_docs)]
    pub eip: u32,
    #[allow(missing_docs)]
    pub eflags: u32,
    #[allow(missing_docs)]
    pub eax: u32,
    #[allow(missing_docs)]
    pub ecx: u32,
    #[allow(missing_docs)]
    pub edx: u32,
    #[allow(missing_docs)]
    pub ebx: u32,
    #[allow(missing_docs)]
    pub esp: u32,
    #[allow(missing_docs)]
    pub ebp: u32,
    #[allow(missing_docs)]
    pub esi: u32,
    #[allow(missing_docs)]
    pub edi: u32,
    #[allow(missing_docs)]
    pub es: u32,
    #[allow(missing_docs)]
    pub cs: u32,
    #[allow(missing_docs)]
    pub ss: u32,
    #[allow(missing_docs)]
    pub ds: u32,
    #[allow(missing_docs)]
    pub fs: u32,
    #[allow(missing_docs)]
    pub gs: u32,
    #[allow(missing_docs)]
    pub ldt: u32,
    #[allow(missing_docs)]
    pub trap: u16,
    /// Offset of the (absent) I/O permission bitmap.
    pub iomap_base: u16,
}

tern_core::static_assert!(core::mem::size_of::<TaskStateSegment>() == 104);

impl TaskStateSegment {
    /// An all-zero TSS.
    #[must_use]
    pub const fn zeroed() -> Self {
        // SAFETY: All fields are plain integers; zero is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

/// A TSS descriptor (32-bit available TSS, byte granularity).
#[must_use]
pub const fn tss_descriptor(base: u32, size: u32) -> u64 {
    descriptor(base, size - 1, 0x89, 0x0)
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
mod install {
    use super::{
        KERNEL_CS, KERNEL_DS, TSS_SELECTOR, TaskStateSegment, code_segment, data_segment,
        tss_descriptor,
    };
    use core::cell::UnsafeCell;

    /// `UnsafeCell` wrapper that is `Sync`: the TSS and GDT are only
    /// mutated with interrupts disabled on the single CPU.
    #[repr(transparent)]
    struct SyncUnsafeCell<T>(UnsafeCell<T>);

    // SAFETY: Mutation happens with interrupts disabled; the CPU reads
    // the TSS directly from memory without racing software writes.
    unsafe impl<T> Sync for SyncUnsafeCell<T> {}

    static TSS: SyncUnsafeCell<TaskStateSegment> =
        SyncUnsafeCell(UnsafeCell::new(TaskStateSegment::zeroed()));

    static GDT: SyncUnsafeCell<[u64; 6]> = SyncUnsafeCell(UnsafeCell::new([0; 6]));

    #[repr(C, packed)]
    struct DescriptorTablePointer {
        limit: u16,
        base: u32,
    }

    /// Builds the table, loads it, reloads the segment registers, and
    /// loads the task register.
    pub fn init() {
        let tss_base = TSS.0.get() as u32;
        let gdt = GDT.0.get();
        // SAFETY: Single-threaded early boot, interrupts still disabled.
        unsafe {
            (*gdt)[0] = 0;
            (*gdt)[1] = code_segment(0);
            (*gdt)[2] = data_segment(0);
            (*gdt)[3] = code_segment(3);
            (*gdt)[4] = data_segment(3);
            (*gdt)[5] = tss_descriptor(tss_base, size_of::<TaskStateSegment>() as u32);

            (*TSS.0.get()).ss0 = u32::from(KERNEL_DS);
            (*TSS.0.get()).iomap_base = size_of::<TaskStateSegment>() as u16;

            let gdtr = DescriptorTablePointer {
                limit: (size_of::<[u64; 6]>() - 1) as u16,
                base: gdt as u32,
            };
            core::arch::asm!(
                "lgdt [{gdtr}]",
                // Far-return to reload CS.
                "push {cs}",
                "lea {tmp}, [2f]",
                "push {tmp}",
                "retf",
                "2:",
                "mov ds, {ds:x}",
                "mov es, {ds:x}",
                "mov fs, {ds:x}",
                "mov gs, {ds:x}",
                "mov ss, {ds:x}",
                "ltr {tr:x}",
                gdtr = in(reg) &gdtr,
                cs = const KERNEL_CS as i32,
                ds = in(reg) u32::from(KERNEL_DS),
                tr = in(reg) u32::from(TSS_SELECTOR),
                tmp = out(reg) _,
            );
        }
    }

    /// Points `esp0` at the given kernel stack top; called on every task
    /// entry so ring-3 traps land on the new task's stack.
    pub fn set_kernel_stack(esp0: u32) {
        // SAFETY: Single CPU, called with interrupts disabled during the
        // switch path.
        unsafe { (*TSS.0.get()).esp0 = esp0 };
    }
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
pub use install::{init, set_kernel_stack};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_kernel_code_descriptor() {
        // The canonical flat 4 GiB ring-0 code descriptor.
        assert_eq!(code_segment(0), 0x00CF_9A00_0000_FFFF);
        assert_eq!(data_segment(0), 0x00CF_9200_0000_FFFF);
    }

    #[test]
    fn user_descriptors_carry_dpl3() {
        assert_eq!(code_segment(3), 0x00CF_FA00_0000_FFFF);
        assert_eq!(data_segment(3), 0x00CF_F200_0000_FFFF);
    }

    #[test]
    fn descriptor_base_and_limit_scatter() {
        let d = descriptor(0x1234_5678, 0xA_BCDE, 0x89, 0x0);
        assert_eq!(d & 0xFFFF, 0xBCDE, "limit low");
        assert_eq!(d >> 16 & 0xFF_FFFF, 0x34_5678, "base low");
        assert_eq!(d >> 40 & 0xFF, 0x89, "access");
        assert_eq!(d >> 48 & 0xF, 0xA, "limit high");
        assert_eq!(d >> 56 & 0xFF, 0x12, "base high");
    }

    #[test]
    fn selector_values() {
        assert_eq!(KERNEL_CS, 0x08);
        assert_eq!(KERNEL_DS, 0x10);
        assert_eq!(USER_CS, 0x1B);
        assert_eq!(USER_DS, 0x23);
        assert_eq!(TSS_SELECTOR, 0x28);
    }
}
