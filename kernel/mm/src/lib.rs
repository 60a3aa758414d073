//! Memory management for the tern kernel.
//!
//! Two-tier page allocation: the identity-mapped kmem region is served by a
//! buddy allocator at 4/8/16/32 KiB granules ([`kmem`]), while the hmem
//! region at the top of physical RAM is a free list of single pages that
//! must be mapped explicitly before use ([`hmem`]). The slab allocator
//! ([`slab`]) and the kernel heap size-class policy ([`heap`]) sit on top.
//!
//! Hardware access (page-table writes, TLB shootdowns) stays behind the
//! [`kmem::RegionBackend`] and [`hmem::ScratchMapper`] seams so everything
//! here runs under `cargo test` on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buddy;
pub mod heap;
pub mod hmem;
pub mod kmem;
pub mod layout;
pub mod slab;
pub mod vm;
