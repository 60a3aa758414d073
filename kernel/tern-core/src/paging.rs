//! 32-bit two-level page-table structures.
//!
//! The i386 paging layout: a 1024-entry page directory whose entries point
//! to 1024-entry page tables, each entry mapping one 4 KiB page. Directory
//! and table entries share the same bit layout, so both levels use
//! [`PageTable`] / [`PageTableEntry`].

use bitflags::bitflags;

use crate::addr::PhysAddr;
use crate::static_assert;

bitflags! {
    /// Page directory/table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Entry maps a page (or table) that is present in memory.
        const PRESENT  = 1 << 0;
        /// Writes are allowed through this entry.
        const WRITE    = 1 << 1;
        /// Ring-3 accesses are allowed through this entry.
        const USER     = 1 << 2;
        /// Set by the CPU when the page is accessed.
        const ACCESSED = 1 << 5;
        /// Set by the CPU when the page is written.
        const DIRTY    = 1 << 6;
    }
}

/// A single page-directory or page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// The empty (not-present) entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry from a page-aligned physical address and flags.
    #[inline]
    #[must_use]
    pub const fn new(addr: PhysAddr, flags: PageFlags) -> Self {
        assert!(addr.is_page_aligned(), "entry address must be page aligned");
        Self(addr.as_u32() | flags.bits())
    }

    /// Returns the raw entry value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Builds an entry from a raw value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the physical address this entry points at.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0).align_page_down()
    }

    /// Returns the flag bits.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Returns `true` if the present bit is set.
    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }
}

/// A 1024-entry page directory or page table.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The entries; indexed by [`VirtAddr::dir_index`](crate::addr::VirtAddr::dir_index)
    /// or [`VirtAddr::table_index`](crate::addr::VirtAddr::table_index).
    pub entries: [PageTableEntry; 1024],
}

static_assert!(core::mem::size_of::<PageTable>() == 4096);

impl PageTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: [PageTableEntry::EMPTY; 1024],
        }
    }

    /// Clears every entry.
    pub fn zero(&mut self) {
        self.entries = [PageTableEntry::EMPTY; 1024];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packing() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x0030_0000),
            PageFlags::PRESENT | PageFlags::WRITE,
        );
        assert_eq!(entry.raw(), 0x0030_0003);
        assert_eq!(entry.addr(), PhysAddr::new(0x0030_0000));
        assert!(entry.is_present());
        assert!(entry.flags().contains(PageFlags::WRITE));
        assert!(!entry.flags().contains(PageFlags::USER));
    }

    #[test]
    fn empty_entry_not_present() {
        assert!(!PageTableEntry::EMPTY.is_present());
        assert_eq!(PageTableEntry::EMPTY.addr(), PhysAddr::zero());
    }

    #[test]
    #[should_panic(expected = "page aligned")]
    fn misaligned_entry_rejected() {
        let _ = PageTableEntry::new(PhysAddr::new(0x123), PageFlags::PRESENT);
    }
}
