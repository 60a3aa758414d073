//! The tern kernel.
//!
//! A small preemptive 32-bit x86 kernel: multiboot boot, flat
//! segmentation, two-tier page allocation (buddy kmem plus free-list
//! hmem), round-robin scheduling with timer preemption, a VFS with a
//! read-only tar initrd, and an ELF loader for user binaries.
//!
//! Pure logic (multiboot parsing, descriptor encoding, ELF validation)
//! compiles everywhere and is tested on the host; everything that
//! touches hardware lives behind `target_os = "none"`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// ── Always-available modules (pure logic, host-testable) ─────────────────

pub mod arch;
pub mod config;
pub mod multiboot;
pub mod proc;

// ── Kernel-runtime modules ───────────────────────────────────────────────

#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod drivers;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod initrd;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod kmain;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod log;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod mm;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod panic;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod sched;
