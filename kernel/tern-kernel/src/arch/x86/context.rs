//! Interrupt entry stubs and context switching.
//!
//! The per-vector stubs normalize the stack into an
//! [`InterruptFrame`](tern_sched::InterruptFrame): the CPU pushes
//! EFLAGS/CS/EIP (and an error code for some exceptions), the stub adds a
//! dummy error code where the CPU did not, the vector number, the
//! general-purpose registers, and CR3. `asm_enter_task` is the inverse:
//! point ESP at a frame, restore, `iret`. Entering a task and resuming a
//! preempted one are therefore the same operation, which is what makes
//! the synthetic frames built for fresh tasks and for `yield` work.

use core::arch::global_asm;

global_asm!(
    r#"
.section .text

// ── Per-vector entry stubs ──────────────────────────────────────────────

.macro isr_noerr n
.globl isr_\n
isr_\n:
    push 0
    push \n
    jmp isr_common
.endm

.macro isr_err n
.globl isr_\n
isr_\n:
    push \n
    jmp isr_common
.endm

.irp n, 0,1,2,3,4,5,6,7,9,15,16,18,19,20,21,22,23,24,25,26,27,28,29,30,31
    isr_noerr \n
.endr
.irp n, 8,10,11,12,13,14,17
    isr_err \n
.endr
.irp n, 32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47
    isr_noerr \n
.endr
isr_noerr 128

// Stub addresses for the first 48 vectors, consumed by idt setup.
.section .rodata
.globl isr_stub_table
isr_stub_table:
.irp n, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47
    .long isr_\n
.endr
.section .text

// ── Common entry: build the frame, dispatch, restore, iret ──────────────

isr_common:
    push eax
    push ebx
    push ecx
    push edx
    push esi
    push edi
    push ebp
    mov eax, cr3
    push eax
    push esp
    call interrupt_dispatch
    add esp, 4
    pop eax
    mov cr3, eax
    pop ebp
    pop edi
    pop esi
    pop edx
    pop ecx
    pop ebx
    pop eax
    add esp, 8
    iretd

// ── Enter a task: adopt its saved frame and iret into it ────────────────

.globl asm_enter_task
asm_enter_task:
    mov esp, [esp + 4]
    pop eax
    mov cr3, eax
    pop ebp
    pop edi
    pop esi
    pop edx
    pop ecx
    pop ebx
    pop eax
    add esp, 8
    iretd

// ── Voluntary yield: synthesize a frame resuming at our return address ──
//
// EAX/ECX/EDX are caller-saved under cdecl, so their frame slots hold
// junk; EBX/ESI/EDI/EBP are preserved for the resumed caller. EFLAGS is
// captured before cli so the task resumes with interrupts enabled.

.globl asm_yield
asm_yield:
    pop ecx
    pushfd
    cli
    push 0x08
    push ecx
    push 0
    push 0
    push eax
    push ebx
    push ecx
    push edx
    push esi
    push edi
    push ebp
    mov eax, cr3
    push eax
    push esp
    call yield_with_frame
    ud2

// ── Run a function on a different stack (task teardown) ─────────────────

.globl asm_switch_stack_and_call
asm_switch_stack_and_call:
    mov eax, [esp + 4]
    mov ecx, [esp + 8]
    mov edx, [esp + 12]
    mov esp, eax
    push edx
    call ecx
    ud2

// ── Drop to ring 3 ──────────────────────────────────────────────────────

.globl asm_enter_usermode
asm_enter_usermode:
    mov ecx, [esp + 4]
    mov edx, [esp + 8]
    mov ax, 0x23
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push 0x23
    push edx
    pushfd
    pop eax
    or eax, 0x200
    push eax
    push 0x1B
    push ecx
    iretd
"#
);

unsafe extern "C" {
    /// Addresses of the 48 per-vector stubs.
    pub static isr_stub_table: [u32; 48];

    /// The ring-3-callable vector's stub.
    pub fn isr_128();

    /// Adopts the frame at `stack_pointer` and irets into it.
    pub fn asm_enter_task(stack_pointer: u32) -> !;

    /// Builds a synthetic frame for the caller and hands it to
    /// `yield_with_frame`. Returns when the task is next scheduled.
    pub fn asm_yield();

    /// Switches to `new_stack_top` and calls `func(arg)`; never returns.
    pub fn asm_switch_stack_and_call(
        new_stack_top: u32,
        func: unsafe extern "C" fn(u32) -> !,
        arg: u32,
    ) -> !;

    /// Irets to ring 3 at `entry` with the given user stack.
    pub fn asm_enter_usermode(entry: u32, user_stack_top: u32) -> !;
}
