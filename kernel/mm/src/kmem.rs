//! The kmem buddy allocator.
//!
//! Owns all identity-mapped kernel RAM past the image: an array of
//! [`Buddy`] descriptors followed by their backing 512 KiB regions.
//! Allocation picks the first descriptor on the requested granule's free
//! list, takes its lowest free slot, and propagates the bit change upward
//! (a coarser granule stops being free once any part of it is allocated)
//! and downward (allocating a coarse granule consumes all contained finer
//! slots). Freeing mirrors this, coalescing with the sibling slot when
//! both halves are free again.
//!
//! When every descriptor is exhausted at the requested granule a new
//! 512 KiB region is appended and handed to the [`RegionBackend`] for
//! mapping. Page tables for the whole kmem window are created at init, so
//! growth never re-enters the allocator.

use core::ptr;

use tern_core::addr::PhysAddr;

use crate::buddy::{Buddy, LINK_HEAD, LINK_NONE, Link};
use crate::layout::{Granule, KMEM_CEILING, REGION_SHIFT, REGION_SIZE};

/// Pattern written over every fresh allocation so stale reads stand out.
pub const DEBUG_FILL: u8 = 0x41;

/// Hardware-side hook invoked when the allocator appends a region.
pub trait RegionBackend {
    /// Makes `[virt, virt + 512 KiB)` usable at its identity mapping of
    /// `phys`. The kmem window's page tables already exist; the backend
    /// only writes entries.
    fn map_region(&mut self, virt: usize, phys: PhysAddr);
}

/// Backend for host tests and for pre-mapped early boot: does nothing.
pub struct NullBackend;

impl RegionBackend for NullBackend {
    fn map_region(&mut self, _virt: usize, _phys: PhysAddr) {}
}

/// Placement of the descriptor array and data regions.
#[derive(Debug, Clone, Copy)]
pub struct KmemParams {
    /// Virtual address of the descriptor array.
    pub descriptor_base: usize,
    /// Maximum number of descriptors the array can hold.
    pub capacity: usize,
    /// Virtual address of the first 512 KiB region (32 KiB aligned).
    pub data_base: usize,
    /// Physical address corresponding to `data_base`.
    pub data_base_phys: PhysAddr,
    /// Physical ceiling of the kmem region.
    pub region_end: PhysAddr,
}

impl KmemParams {
    /// Computes the boot placement: the descriptor array sits immediately
    /// after the kernel image, sized for all of RAM, rounded up to 32 KiB
    /// so the regions behind it keep natural allocation alignment.
    #[must_use]
    pub fn compute(kernel_end: PhysAddr, ram_amount: u32) -> Self {
        let total_pages = (ram_amount + 4095) >> 12;
        // One descriptor per 128 pages, 64 descriptors per page.
        let total_buddies = (total_pages + 127) >> 7;
        let descriptor_pages = (total_buddies + 63) >> 6;

        let array_phys = kernel_end.align_page_up();
        let descriptor_base = array_phys.to_virt().as_u32() as usize;
        let array_end = (descriptor_base + ((descriptor_pages as usize) << 12) + 32767) & !32767;
        let array_size = array_end - descriptor_base;

        let data_base_phys = array_phys + array_size as u32;
        let region_end_raw = data_base_phys.as_u32().saturating_add(total_pages << 12);
        let region_end = PhysAddr::new(region_end_raw.min(KMEM_CEILING));

        Self {
            descriptor_base,
            capacity: array_size / core::mem::size_of::<Buddy>(),
            data_base: array_end,
            data_base_phys,
            region_end,
        }
    }
}

/// The buddy allocator over the kmem region.
pub struct KmemAllocator<B: RegionBackend> {
    descriptors: *mut Buddy,
    capacity: usize,
    /// Number of live descriptors (appended regions).
    count: usize,
    data_base: usize,
    data_base_phys: PhysAddr,
    /// One free-list head per granule; `LINK_NONE` when empty.
    heads: [u32; 4],
    /// Highest physical address used by kmem, exclusive.
    phys_end: PhysAddr,
    region_end: PhysAddr,
    backend: B,
}

// SAFETY: The raw descriptor pointer refers to memory owned by the
// allocator for its whole lifetime; the allocator is handed between
// contexts only under its outer lock.
unsafe impl<B: RegionBackend + Send> Send for KmemAllocator<B> {}

impl<B: RegionBackend> KmemAllocator<B> {
    /// Creates the allocator and declares the first region immediately
    /// allocatable (the descriptor lives in the already-mapped kernel
    /// window, so no mapping is required yet).
    ///
    /// # Safety
    ///
    /// `params.descriptor_base` must point at writable memory large enough
    /// for `params.capacity` descriptors, and `params.data_base` must be
    /// the 32 KiB-aligned start of at least one mapped 512 KiB region.
    pub unsafe fn new(params: KmemParams, backend: B) -> Self {
        assert!(params.capacity > 0, "no room for buddy descriptors");
        assert!(params.data_base & 32767 == 0, "data base must be 32 KiB aligned");

        let mut this = Self {
            descriptors: params.descriptor_base as *mut Buddy,
            capacity: params.capacity,
            count: 0,
            data_base: params.data_base,
            data_base_phys: params.data_base_phys,
            heads: [LINK_NONE; 4],
            phys_end: params.data_base_phys,
            region_end: params.region_end,
            backend,
        };
        this.append_region_unmapped();
        this.phys_end = this.phys_end + REGION_SIZE as u32;
        this
    }

    /// Highest physical address used by kmem so far, exclusive.
    #[must_use]
    pub fn phys_end(&self) -> PhysAddr {
        self.phys_end
    }

    /// Number of 512 KiB regions currently owned.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.count
    }

    fn buddy(&self, bi: u32) -> &Buddy {
        debug_assert!((bi as usize) < self.count);
        // SAFETY: `bi` indexes a live descriptor per the count check.
        unsafe { &*self.descriptors.add(bi as usize) }
    }

    fn buddy_mut(&mut self, bi: u32) -> &mut Buddy {
        debug_assert!((bi as usize) < self.count);
        // SAFETY: `bi` indexes a live descriptor per the count check.
        unsafe { &mut *self.descriptors.add(bi as usize) }
    }

    // -- free lists --------------------------------------------------------

    fn link_front(&mut self, bi: u32, g: Granule) {
        debug_assert!(!self.buddy(bi).links[g as usize].is_linked());
        let old = self.heads[g as usize];
        if old != LINK_NONE {
            self.buddy_mut(old).links[g as usize].prev = bi;
        }
        self.buddy_mut(bi).links[g as usize] = Link {
            prev: LINK_HEAD,
            next: old,
        };
        self.heads[g as usize] = bi;
    }

    fn unlink(&mut self, bi: u32, g: Granule) {
        let link = self.buddy(bi).links[g as usize];
        if !link.is_linked() {
            return;
        }
        if link.prev == LINK_HEAD {
            self.heads[g as usize] = link.next;
        } else {
            self.buddy_mut(link.prev).links[g as usize].next = link.next;
        }
        if link.next != LINK_NONE {
            self.buddy_mut(link.next).links[g as usize].prev = link.prev;
        }
        self.buddy_mut(bi).links[g as usize] = Link::UNLINKED;
    }

    // -- bit transitions ---------------------------------------------------

    /// Marks one slot allocated; unlinks the descriptor once the granule
    /// has no free slot left. Returns whether the slot was free before.
    fn alloc_bit(&mut self, bi: u32, g: Granule, index: u32) -> bool {
        let was_free = self.buddy_mut(bi).clear_free(g, index);
        if self.buddy(bi).is_exhausted(g) {
            self.unlink(bi, g);
        }
        was_free
    }

    /// Marks one slot free; relinks the descriptor if the granule had no
    /// free slot before.
    fn free_bit(&mut self, bi: u32, g: Granule, index: u32) {
        if !self.buddy(bi).links[g as usize].is_linked() && self.buddy(bi).is_exhausted(g) {
            self.link_front(bi, g);
        }
        self.buddy_mut(bi).set_free(g, index);
    }

    // -- allocation --------------------------------------------------------

    /// Allocates one granule of size `g`, growing by a region if needed.
    ///
    /// # Panics
    ///
    /// Panics when physical RAM is exhausted; allocator failure is fatal.
    pub fn alloc(&mut self, g: Granule) -> usize {
        if self.heads[g as usize] == LINK_NONE {
            self.grow();
        }
        let bi = self.heads[g as usize];
        assert!(bi != LINK_NONE, "kmem exhausted allocating {g:?}");

        let addr = self.slot_alloc(bi, g);
        // SAFETY: The returned slot is mapped, owned by the caller, and
        // g.size() bytes long.
        unsafe { ptr::write_bytes(addr as *mut u8, DEBUG_FILL, g.size()) };
        addr
    }

    fn slot_addr(&self, bi: u32, g: Granule, index: u32) -> usize {
        self.data_base + ((bi as usize) << REGION_SHIFT) + ((index as usize) << g.shift())
    }

    fn slot_alloc(&mut self, bi: u32, g: Granule) -> usize {
        use Granule::{K4, K8, K16, K32};

        let index = self
            .buddy(bi)
            .lowest_free(g)
            .expect("descriptor on free list without a free slot");

        match g {
            K4 => {
                self.alloc_bit(bi, K4, index);
                // A coarser slot stops being free once any part of it is
                // allocated; stop propagating at the first already-clear bit.
                if self.alloc_bit(bi, K8, index >> 1)
                    && self.alloc_bit(bi, K16, index >> 2)
                {
                    self.alloc_bit(bi, K32, index >> 3);
                }
            }
            K8 => {
                self.alloc_bit(bi, K4, index << 1);
                self.alloc_bit(bi, K4, (index << 1) + 1);
                self.alloc_bit(bi, K8, index);
                if self.alloc_bit(bi, K16, index >> 1) {
                    self.alloc_bit(bi, K32, index >> 2);
                }
            }
            K16 => {
                for i in 0..4 {
                    self.alloc_bit(bi, K4, (index << 2) + i);
                }
                self.alloc_bit(bi, K8, index << 1);
                self.alloc_bit(bi, K8, (index << 1) + 1);
                self.alloc_bit(bi, K16, index);
                self.alloc_bit(bi, K32, index >> 1);
            }
            K32 => {
                self.alloc_bit(bi, K32, index);
                for i in 0..8 {
                    self.alloc_bit(bi, K4, (index << 3) + i);
                }
                for i in 0..4 {
                    self.alloc_bit(bi, K8, (index << 2) + i);
                }
                self.alloc_bit(bi, K16, index << 1);
                self.alloc_bit(bi, K16, (index << 1) + 1);
            }
        }

        self.slot_addr(bi, g, index)
    }

    // -- freeing -----------------------------------------------------------

    /// Frees an allocation of granule `g` previously returned by
    /// [`alloc`](Self::alloc).
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not aligned to `g` or outside the kmem region.
    pub fn free(&mut self, g: Granule, addr: usize) {
        let rel = addr - self.data_base;
        assert!(rel & (g.size() - 1) == 0, "misaligned {g:?} free");
        #[allow(clippy::cast_possible_truncation)]
        let bi = (rel >> REGION_SHIFT) as u32;
        assert!((bi as usize) < self.count, "free outside the kmem region");
        #[allow(clippy::cast_possible_truncation)]
        let index = ((rel & (REGION_SIZE - 1)) >> g.shift()) as u32;

        self.free_up(bi, g, index);
        self.free_down(bi, g, index);
    }

    /// Sets the freed bit and coalesces upward while the sibling slot is
    /// also free.
    fn free_up(&mut self, bi: u32, g: Granule, index: u32) {
        self.free_bit(bi, g, index);
        if let Some(coarser) = g.coarser() {
            if self.buddy(bi).is_free(g, index ^ 1) {
                self.free_up(bi, coarser, index >> 1);
            }
        }
    }

    /// Sets every contained finer bit below a freed slot.
    fn free_down(&mut self, bi: u32, g: Granule, index: u32) {
        if let Some(finer) = g.finer() {
            let child = index << 1;
            self.free_bit(bi, finer, child);
            self.free_down(bi, finer, child);
            self.free_bit(bi, finer, child ^ 1);
            self.free_down(bi, finer, child ^ 1);
        }
    }

    // -- growth ------------------------------------------------------------

    /// Appends a fully-free descriptor without mapping its region.
    fn append_region_unmapped(&mut self) {
        let pos = self.count;
        assert!(pos < self.capacity, "buddy descriptor array full");
        // SAFETY: `pos` is within the descriptor array per the capacity
        // check; write initializes possibly-uninitialized memory.
        unsafe { self.descriptors.add(pos).write(Buddy::fully_free()) };
        self.count += 1;

        #[allow(clippy::cast_possible_truncation)]
        let bi = pos as u32;
        for g in Granule::ALL {
            self.link_front(bi, g);
        }
    }

    /// Appends and maps a new 512 KiB region.
    fn grow(&mut self) {
        self.append_region_unmapped();
        let pos = self.count - 1;

        let virt = self.data_base + (pos << REGION_SHIFT);
        #[allow(clippy::cast_possible_truncation)]
        let phys = self.data_base_phys + ((pos << REGION_SHIFT) as u32);
        debug_assert_eq!(phys, self.phys_end, "region append out of order");
        self.backend.map_region(virt, phys);

        self.phys_end = self.phys_end + REGION_SIZE as u32;
        assert!(
            self.phys_end.as_u32() < self.region_end.as_u32(),
            "kmem collided with its region ceiling"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Granule::{K4, K8, K16, K32};
    use std::alloc::Layout;

    /// Host harness: descriptor storage plus 32 KiB-aligned region memory.
    struct Harness {
        descriptors: Vec<Buddy>,
        data: *mut u8,
        data_layout: Layout,
    }

    impl Harness {
        fn new(regions: usize) -> Self {
            let data_layout = Layout::from_size_align(regions * REGION_SIZE, 32768).unwrap();
            // SAFETY: layout has non-zero size.
            let data = unsafe { std::alloc::alloc(data_layout) };
            assert!(!data.is_null());
            Self {
                descriptors: Vec::with_capacity(regions),
                data,
                data_layout,
            }
        }

        fn allocator(&mut self) -> KmemAllocator<NullBackend> {
            let params = KmemParams {
                descriptor_base: self.descriptors.as_mut_ptr() as usize,
                capacity: self.descriptors.capacity(),
                data_base: self.data as usize,
                data_base_phys: PhysAddr::new(0x0080_0000),
                region_end: PhysAddr::new(KMEM_CEILING),
            };
            // SAFETY: The harness owns writable storage for both the
            // descriptor array and the data regions.
            unsafe { KmemAllocator::new(params, NullBackend) }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            // SAFETY: Allocated with the same layout in `new`.
            unsafe { std::alloc::dealloc(self.data, self.data_layout) };
        }
    }

    /// Checks the bitmap derivation rule on every descriptor: a coarser
    /// bit is set iff both of its finer children are set.
    fn check_consistency<B: RegionBackend>(a: &KmemAllocator<B>) {
        for bi in 0..a.count {
            #[allow(clippy::cast_possible_truncation)]
            let b = a.buddy(bi as u32);
            for g in [K8, K16, K32] {
                let finer = g.finer().unwrap();
                for i in 0..g.slots() {
                    let children = b.is_free(finer, i << 1) && b.is_free(finer, (i << 1) + 1);
                    assert_eq!(
                        b.is_free(g, i),
                        children,
                        "bitmap rule violated at {g:?}[{i}]"
                    );
                }
            }
        }
    }

    #[test]
    fn buddy_round_trip() {
        let mut h = Harness::new(1);
        let mut kmem = h.allocator();
        // Boot leaves an odd number of pages consumed before the first
        // caller-visible allocation; model that with one leaked page.
        let _primer = kmem.alloc(K4);

        let a = kmem.alloc(K4);
        let b = kmem.alloc(K8);
        assert_eq!(b, a + 4096);

        kmem.free(K4, a);
        let c = kmem.alloc(K4);
        assert_eq!(c, a);

        kmem.free(K8, b);
        kmem.free(K4, c);
        check_consistency(&kmem);

        let big = kmem.alloc(K32);
        assert_eq!(big & 32767, 0, "32 KiB allocation must be aligned");
        check_consistency(&kmem);
    }

    #[test]
    fn freed_pointers_are_reissued() {
        let mut h = Harness::new(1);
        let mut kmem = h.allocator();

        for g in Granule::ALL {
            let p = kmem.alloc(g);
            kmem.free(g, p);
            let q = kmem.alloc(g);
            assert_eq!(p, q, "freed {g:?} slot must be reissuable");
            kmem.free(g, q);
        }
        check_consistency(&kmem);
    }

    #[test]
    fn live_allocations_never_overlap() {
        let mut h = Harness::new(16);
        let mut kmem = h.allocator();

        let mut live: Vec<(Granule, usize)> = Vec::new();
        // Mixed-size churn, mirroring the original allocator stress run.
        for round in 0..200 {
            let g = Granule::ALL[round % 4];
            let p = kmem.alloc(g);
            for &(og, oa) in &live {
                let overlap = p < oa + og.size() && oa < p + g.size();
                assert!(!overlap, "{g:?}@{p:#x} overlaps {og:?}@{oa:#x}");
            }
            live.push((g, p));
            if round % 3 == 0 {
                let (og, oa) = live.remove(round % live.len());
                kmem.free(og, oa);
            }
        }
        check_consistency(&kmem);
        for (g, a) in live {
            kmem.free(g, a);
        }
        check_consistency(&kmem);

        // Everything freed: a full region's worth of 32 KiB slots fits again.
        let mut slots = Vec::new();
        for _ in 0..16 {
            slots.push(kmem.alloc(K32));
        }
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 16);
    }

    #[test]
    fn exhaustion_grows_a_region() {
        let mut h = Harness::new(2);
        let mut kmem = h.allocator();
        assert_eq!(kmem.region_count(), 1);

        for _ in 0..16 {
            kmem.alloc(K32);
        }
        // First region exhausted at every granule.
        let p = kmem.alloc(K16);
        assert_eq!(kmem.region_count(), 2);
        assert_eq!(p, h.data as usize + REGION_SIZE);
        check_consistency(&kmem);
    }

    #[test]
    fn debug_fill_pattern() {
        let mut h = Harness::new(1);
        let mut kmem = h.allocator();
        let p = kmem.alloc(K8);
        // SAFETY: p points at an owned 8 KiB allocation in the harness.
        let bytes = unsafe { std::slice::from_raw_parts(p as *const u8, K8.size()) };
        assert!(bytes.iter().all(|&b| b == DEBUG_FILL));
    }

    #[test]
    fn params_compute_placement() {
        // 64 MiB of RAM, kernel image ending at 2 MiB + change.
        let params = KmemParams::compute(PhysAddr::new(0x0020_0123), 64 * 1024 * 1024);
        // 16384 pages -> 128 descriptors -> 2 descriptor pages, rounded to
        // 32 KiB past the page-aligned kernel end.
        assert_eq!(params.descriptor_base, 0xC020_1000);
        assert_eq!(params.data_base % 32768, 0);
        assert!(params.capacity >= 128);
        assert_eq!(
            params.data_base_phys.to_virt().as_u32() as usize,
            params.data_base
        );
        assert!(params.region_end.as_u32() <= KMEM_CEILING);
    }
}
