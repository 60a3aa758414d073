//! i386 support: segmentation, interrupts, timer, context switching.
//!
//! Table encodings are pure and host-tested; everything executing
//! privileged instructions is compiled for the kernel target only.

pub mod gdt;
pub mod idt;

#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod boot;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod context;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod interrupts;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod pic;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod pit;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod port;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod tlb;
