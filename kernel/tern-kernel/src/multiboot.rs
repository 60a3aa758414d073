//! Multiboot v1 boot-information parsing.
//!
//! The loader hands the kernel a physical pointer to the info structure
//! and a magic value. We only consume the memory map: the usable region
//! starting at physical 1 MiB determines the total RAM the allocators
//! may claim.

use bitflags::bitflags;

/// Magic the bootloader passes in EAX.
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// Physical start of the usable RAM region we size the system by.
pub const RAM_START: u64 = 0x0010_0000;

bitflags! {
    /// `flags` field of the info structure (the bits we care about).
    #[derive(Debug, Clone, Copy)]
    pub struct InfoFlags: u32 {
        /// `mem_lower`/`mem_upper` are valid.
        const MEMORY = 1 << 0;
        /// `mmap_length`/`mmap_addr` are valid.
        const MEM_MAP = 1 << 6;
    }
}

/// Byte offset of `flags` in the info structure.
pub const FLAGS_OFFSET: usize = 0;
/// Byte offset of `mmap_length`.
pub const MMAP_LENGTH_OFFSET: usize = 44;
/// Byte offset of `mmap_addr`.
pub const MMAP_ADDR_OFFSET: usize = 48;

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("4 bytes"))
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().expect("8 bytes"))
}

/// Scans a raw memory-map buffer for the region starting at
/// [`RAM_START`] and returns its length.
///
/// Each entry is `size` (excluding itself), `base_addr`, `length`,
/// `type`; entries advance by `size + 4`.
#[must_use]
pub fn ram_at_1mib(mmap: &[u8]) -> Option<u64> {
    let mut offset = 0;
    while offset + 24 <= mmap.len() {
        let size = read_u32(mmap, offset);
        let base = read_u64(mmap, offset + 4);
        let length = read_u64(mmap, offset + 12);
        if base == RAM_START {
            return Some(length);
        }
        if size == 0 {
            break;
        }
        offset += size as usize + 4;
    }
    None
}

/// Reads the bootloader-provided info structure and returns the total
/// RAM amount in bytes.
///
/// # Safety
///
/// `info_phys` must be the physical address of a valid multiboot v1 info
/// structure, identity-mapped into the kernel window.
///
/// # Panics
///
/// Panics on a bad magic, a missing memory map, or RAM not starting at
/// 1 MiB.
#[cfg(all(target_os = "none", target_arch = "x86"))]
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn read_boot_info(info_phys: u32, magic: u32) -> u32 {
    use tern_core::addr::PhysAddr;

    assert_eq!(magic, BOOTLOADER_MAGIC, "not booted by a multiboot loader");

    // SAFETY: The loader guarantees at least the fixed part of the info
    // structure; it is reachable through the kernel window.
    let info = unsafe {
        core::slice::from_raw_parts(
            PhysAddr::new(info_phys).to_virt().as_ptr::<u8>(),
            MMAP_ADDR_OFFSET + 4,
        )
    };
    let flags = InfoFlags::from_bits_truncate(read_u32(info, FLAGS_OFFSET));
    assert!(flags.contains(InfoFlags::MEM_MAP), "no memory map provided");

    let mmap_length = read_u32(info, MMAP_LENGTH_OFFSET);
    let mmap_addr = read_u32(info, MMAP_ADDR_OFFSET);
    // SAFETY: The loader-provided map is identity-mapped like the info
    // structure itself.
    let mmap = unsafe {
        core::slice::from_raw_parts(
            PhysAddr::new(mmap_addr).to_virt().as_ptr::<u8>(),
            mmap_length as usize,
        )
    };

    let ram = ram_at_1mib(mmap).expect("no usable RAM region at 1 MiB");
    assert!(ram != 0, "empty RAM region");
    ram.min(u64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(base: u64, length: u64, kind: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&20u32.to_le_bytes());
        out.extend_from_slice(&base.to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&kind.to_le_bytes());
        out
    }

    #[test]
    fn finds_the_1mib_region() {
        let mut mmap = Vec::new();
        mmap.extend(entry(0, 0x9FC00, 1));
        mmap.extend(entry(0x9FC00, 0x400, 2));
        mmap.extend(entry(0x10_0000, 63 * 1024 * 1024, 1));
        assert_eq!(ram_at_1mib(&mmap), Some(63 * 1024 * 1024));
    }

    #[test]
    fn missing_region_is_none() {
        let mmap = entry(0, 0x9FC00, 1);
        assert_eq!(ram_at_1mib(&mmap), None);
        assert_eq!(ram_at_1mib(&[]), None);
    }

    #[test]
    fn truncated_map_stops_cleanly() {
        let mut mmap = entry(0, 0x1000, 1);
        mmap.truncate(10);
        assert_eq!(ram_at_1mib(&mmap), None);
    }

    #[test]
    fn flag_bits() {
        let flags = InfoFlags::from_bits_truncate(1 << 6 | 1);
        assert!(flags.contains(InfoFlags::MEM_MAP));
        assert!(flags.contains(InfoFlags::MEMORY));
    }
}
