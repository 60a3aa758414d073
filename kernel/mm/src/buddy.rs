//! Buddy descriptor: per-region free-bit maps at the four granules.
//!
//! Each descriptor covers one 512 KiB region and stores a free-bit map per
//! granule (128/64/32/16 bits; bit set means free) plus one free-list link
//! pair per granule. The link fields are arena indices managed by
//! [`kmem::KmemAllocator`](crate::kmem::KmemAllocator); this module owns
//! only the bit-level state.
//!
//! Invariants: a granule bit is set iff all four of its sub-granules at the
//! next-finer size are set; a descriptor sits on a granule's free list iff
//! it has any free bit at that granule.

use tern_core::collections::bitset::words;
use tern_core::static_assert;

use crate::layout::Granule;

/// "No buddy" sentinel for link fields.
pub const LINK_NONE: u32 = u32::MAX;

/// "Linked as first element; predecessor is the list head" sentinel.
pub const LINK_HEAD: u32 = u32::MAX - 1;

/// A doubly-linked free-list membership for one granule.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Link {
    /// Previous buddy index, [`LINK_HEAD`] for the first element, or
    /// [`LINK_NONE`] when not on the list.
    pub prev: u32,
    /// Next buddy index or [`LINK_NONE`].
    pub next: u32,
}

impl Link {
    /// The unlinked state.
    pub const UNLINKED: Self = Self {
        prev: LINK_NONE,
        next: LINK_NONE,
    };

    /// Returns `true` while this buddy is on the granule's free list.
    #[inline]
    #[must_use]
    pub const fn is_linked(self) -> bool {
        self.prev != LINK_NONE
    }
}

/// Free-bit maps and free-list links for one 512 KiB region.
#[repr(C)]
pub struct Buddy {
    k4: [u32; 4],
    k8: [u32; 2],
    k16: [u32; 1],
    /// Only the low 16 bits are used.
    k32: [u32; 1],
    /// One link pair per granule, indexed by `Granule as usize`.
    pub links: [Link; 4],
}

static_assert!(core::mem::size_of::<Buddy>() == 64);

impl Buddy {
    /// A descriptor with every granule fully free and no list membership.
    #[must_use]
    pub const fn fully_free() -> Self {
        Self {
            k4: [u32::MAX; 4],
            k8: [u32::MAX; 2],
            k16: [u32::MAX],
            k32: [0xFFFF],
            links: [Link::UNLINKED; 4],
        }
    }

    fn bits(&self, g: Granule) -> &[u32] {
        match g {
            Granule::K4 => &self.k4,
            Granule::K8 => &self.k8,
            Granule::K16 => &self.k16,
            Granule::K32 => &self.k32,
        }
    }

    fn bits_mut(&mut self, g: Granule) -> &mut [u32] {
        match g {
            Granule::K4 => &mut self.k4,
            Granule::K8 => &mut self.k8,
            Granule::K16 => &mut self.k16,
            Granule::K32 => &mut self.k32,
        }
    }

    /// Returns the free bit for slot `index` at granule `g`.
    #[must_use]
    pub fn is_free(&self, g: Granule, index: u32) -> bool {
        debug_assert!(index < g.slots());
        words::test(self.bits(g), index)
    }

    /// Clears the free bit for slot `index`, returning whether it was set.
    pub fn clear_free(&mut self, g: Granule, index: u32) -> bool {
        debug_assert!(index < g.slots());
        let was_free = words::test(self.bits(g), index);
        words::clear(self.bits_mut(g), index);
        was_free
    }

    /// Sets the free bit for slot `index`.
    pub fn set_free(&mut self, g: Granule, index: u32) {
        debug_assert!(index < g.slots());
        words::set(self.bits_mut(g), index);
    }

    /// Returns `true` when no slot at granule `g` is free.
    #[must_use]
    pub fn is_exhausted(&self, g: Granule) -> bool {
        self.bits(g).iter().all(|&w| w == 0)
    }

    /// Returns the lowest free slot at granule `g`, if any.
    #[must_use]
    pub fn lowest_free(&self, g: Granule) -> Option<u32> {
        words::find_set(self.bits(g))
    }

    /// Counts the free bytes accounted at granule `g`.
    #[must_use]
    pub fn free_bytes_at(&self, g: Granule) -> usize {
        let bits: u32 = self.bits(g).iter().map(|w| w.count_ones()).sum();
        bits as usize * g.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_free_has_every_slot() {
        let b = Buddy::fully_free();
        for g in Granule::ALL {
            assert!(!b.is_exhausted(g));
            assert_eq!(b.lowest_free(g), Some(0));
            assert_eq!(b.free_bytes_at(g), 512 * 1024);
            for i in 0..g.slots() {
                assert!(b.is_free(g, i));
            }
        }
    }

    #[test]
    fn clear_and_set_round_trip() {
        let mut b = Buddy::fully_free();
        assert!(b.clear_free(Granule::K16, 5));
        assert!(!b.is_free(Granule::K16, 5));
        // Clearing an already-allocated slot reports it was not free.
        assert!(!b.clear_free(Granule::K16, 5));
        b.set_free(Granule::K16, 5);
        assert!(b.is_free(Granule::K16, 5));
    }

    #[test]
    fn exhaustion_at_the_coarsest_granule() {
        let mut b = Buddy::fully_free();
        for i in 0..16 {
            b.clear_free(Granule::K32, i);
        }
        assert!(b.is_exhausted(Granule::K32));
        assert!(!b.is_exhausted(Granule::K4));
    }
}
