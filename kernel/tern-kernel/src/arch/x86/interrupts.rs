//! IDT construction and interrupt dispatch.
//!
//! All 48 hardware/CPU vectors share one assembly entry path that builds
//! an [`InterruptFrame`] and calls [`interrupt_dispatch`], which tracks
//! the nesting depth and forwards to the registered handler. Unhandled
//! vectors panic with a register dump.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use tern_core::kfatal;
use tern_core::sync::preempt;
use tern_sched::InterruptFrame;

use super::context;
use super::idt::{HW_VECTORS, IdtEntry};
use super::tlb;
use crate::config::SYSCALL_VECTOR;

/// A registered interrupt handler.
pub type Handler = fn(&mut InterruptFrame);

/// Handler table; slot 0 means unhandled. Stored as addresses so
/// registration is lock-free and ISR reads never block.
static HANDLERS: [AtomicUsize; 256] = [const { AtomicUsize::new(0) }; 256];

#[repr(transparent)]
struct SyncUnsafeCell<T>(UnsafeCell<T>);

// SAFETY: The IDT is written once during single-threaded boot and only
// read by the CPU afterwards.
unsafe impl<T> Sync for SyncUnsafeCell<T> {}

static IDT: SyncUnsafeCell<[IdtEntry; 256]> =
    SyncUnsafeCell(UnsafeCell::new([IdtEntry::MISSING; 256]));

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Builds and loads the IDT. Interrupts stay disabled until
/// [`enable`] is called.
pub fn init() {
    let idt = IDT.0.get();
    // SAFETY: Single-threaded early boot; the stub table is produced by
    // the assembly module.
    unsafe {
        for (vector, entry) in (*idt).iter_mut().enumerate().take(HW_VECTORS) {
            *entry = IdtEntry::interrupt_gate(context::isr_stub_table[vector], 0);
        }
        (*idt)[SYSCALL_VECTOR] = IdtEntry::interrupt_gate(context::isr_128 as usize as u32, 3);

        let idtr = DescriptorTablePointer {
            limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: idt as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &idtr, options(nostack));
    }
}

/// Registers a handler for one of the 48 hardware/CPU vectors.
///
/// # Panics
///
/// Panics on an out-of-range vector.
pub fn register_handler(vector: usize, handler: Handler) {
    assert!(vector < HW_VECTORS, "vector {vector} out of range");
    HANDLERS[vector].store(handler as usize, Ordering::Release);
}

/// Unmasks interrupts on the CPU.
pub fn enable() {
    // SAFETY: sti is always safe in ring 0 once the IDT is loaded.
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
}

/// Masks interrupts on the CPU.
pub fn disable() {
    // SAFETY: cli is always safe in ring 0.
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
}

/// Common dispatcher, called by the assembly entry path with a pointer
/// to the frame it built on the interrupted stack.
#[unsafe(no_mangle)]
extern "C" fn interrupt_dispatch(frame: *mut InterruptFrame) {
    preempt::enter_interrupt();

    // SAFETY: The entry stub passes a frame it just built on this stack.
    let frame = unsafe { &mut *frame };
    let vector = frame.interrupt_number as usize;
    let raw = HANDLERS[vector].load(Ordering::Acquire);

    if raw == 0 {
        let cr2 = tlb::read_cr2();
        kfatal!(
            "UNHANDLED INTERRUPT {} ERR {:#x}\n\
             EAX {:#010x} EBX {:#010x} ECX {:#010x} EDX {:#010x}\n\
             ESI {:#010x} EDI {:#010x} EBP {:#010x} CR2 {:#010x}\n\
             EIP {:#010x} CS {:#x} EFLAGS {:#x}",
            frame.interrupt_number,
            frame.error_code,
            frame.eax,
            frame.ebx,
            frame.ecx,
            frame.edx,
            frame.esi,
            frame.edi,
            frame.ebp,
            cr2,
            frame.eip,
            frame.cs,
            frame.eflags,
        );
        panic!(
            "unhandled interrupt {} (error code {:#x})",
            frame.interrupt_number, frame.error_code
        );
    }

    // SAFETY: Only valid `Handler` values are stored into HANDLERS.
    let handler: Handler = unsafe { core::mem::transmute(raw) };
    handler(frame);

    preempt::leave_interrupt();
}
