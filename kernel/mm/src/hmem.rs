//! The hmem page allocator.
//!
//! High memory sits above the kmem ceiling and cannot be identity-mapped,
//! so pages are handed out by physical address and mapped explicitly by
//! the caller. Free pages form a single-linked list threaded through their
//! own first word; reading or writing that word requires a temporary
//! mapping, provided through [`ScratchMapper`]. When the list is empty the
//! region grows by bumping `phys_end` downward from the top of RAM.

use tern_core::addr::{PAGE_SIZE, PhysAddr};

/// Maps a physical page just long enough to touch its first word.
///
/// The kernel implementation is the per-task scoped scratch mapping; host
/// tests translate the address into a plain buffer.
pub trait ScratchMapper {
    /// Runs `f` over a pointer to the first word of `phys`.
    fn with_mapping<R>(&self, phys: PhysAddr, f: impl FnOnce(*mut u32) -> R) -> R;
}

/// Free-list allocator for single hmem pages.
pub struct HmemAllocator {
    /// Head of the free list; the zero address means empty. Each free page
    /// stores the next head in its first word.
    free_head: PhysAddr,
    /// Lowest physical address used by hmem; grows downward.
    phys_end: PhysAddr,
}

impl HmemAllocator {
    /// Creates the allocator with an empty free list, bumping down from
    /// `ram_top` (exclusive).
    #[must_use]
    pub fn new(ram_top: PhysAddr) -> Self {
        Self {
            free_head: PhysAddr::zero(),
            phys_end: ram_top.align_page_down(),
        }
    }

    /// Lowest physical address handed out so far.
    #[must_use]
    pub fn phys_end(&self) -> PhysAddr {
        self.phys_end
    }

    /// Allocates one physical page. The page is unmapped; the caller maps
    /// it wherever it is needed.
    pub fn alloc_page<M: ScratchMapper>(&mut self, mapper: &M) -> PhysAddr {
        if self.free_head.is_zero() {
            self.phys_end = self.phys_end - PAGE_SIZE;
            self.phys_end
        } else {
            let page = self.free_head;
            // SAFETY: `page` is a free page owned by the list; its first
            // word holds the next head.
            let next = mapper.with_mapping(page, |p| unsafe { p.read() });
            self.free_head = PhysAddr::new(next);
            page
        }
    }

    /// Returns a page to the free list.
    ///
    /// # Panics
    ///
    /// Panics if `addr` lies below the bump cursor (not an hmem page).
    pub fn free_page<M: ScratchMapper>(&mut self, mapper: &M, addr: PhysAddr) {
        assert!(
            addr.as_u32() >= self.phys_end.as_u32(),
            "freeing a page below the hmem region"
        );
        let old_head = self.free_head;
        // SAFETY: The caller relinquishes `addr`; its first word becomes
        // the list link (zero terminates the list).
        mapper.with_mapping(addr, |p| unsafe { p.write(old_head.as_u32()) });
        self.free_head = addr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Maps fictional physical pages onto a host buffer.
    struct BufMapper {
        base: *mut u8,
        origin: u32,
    }

    impl ScratchMapper for BufMapper {
        fn with_mapping<R>(&self, phys: PhysAddr, f: impl FnOnce(*mut u32) -> R) -> R {
            let off = (phys.as_u32() - self.origin) as usize;
            // SAFETY: Tests only pass pages inside the backing buffer.
            f(unsafe { self.base.add(off).cast::<u32>() })
        }
    }

    const TOP: u32 = 0x0800_0000;
    const PAGES: usize = 8;

    fn harness() -> (Vec<u8>, BufMapper) {
        let mut buf = vec![0xAAu8; PAGES * PAGE_SIZE as usize];
        let mapper = BufMapper {
            base: buf.as_mut_ptr(),
            origin: TOP - (PAGES * PAGE_SIZE as usize) as u32,
        };
        (buf, mapper)
    }

    #[test]
    fn bumps_downward_when_list_empty() {
        let (_buf, mapper) = harness();
        let mut hmem = HmemAllocator::new(PhysAddr::new(TOP));

        let a = hmem.alloc_page(&mapper);
        let b = hmem.alloc_page(&mapper);
        assert_eq!(a.as_u32(), TOP - 4096);
        assert_eq!(b.as_u32(), TOP - 8192);
        assert_eq!(hmem.phys_end(), b);
    }

    #[test]
    fn free_list_is_lifo() {
        let (_buf, mapper) = harness();
        let mut hmem = HmemAllocator::new(PhysAddr::new(TOP));

        let a = hmem.alloc_page(&mapper);
        let b = hmem.alloc_page(&mapper);
        let c = hmem.alloc_page(&mapper);

        hmem.free_page(&mapper, a);
        hmem.free_page(&mapper, c);

        // Last freed comes back first, then the chain, then the bump.
        assert_eq!(hmem.alloc_page(&mapper), c);
        assert_eq!(hmem.alloc_page(&mapper), a);
        let d = hmem.alloc_page(&mapper);
        assert_eq!(d.as_u32(), b.as_u32() - 4096);
    }

    #[test]
    fn single_page_list_terminates() {
        let (_buf, mapper) = harness();
        let mut hmem = HmemAllocator::new(PhysAddr::new(TOP));

        let a = hmem.alloc_page(&mapper);
        hmem.free_page(&mapper, a);
        assert_eq!(hmem.alloc_page(&mapper), a);
        // List drained: next allocation bumps downward again.
        let b = hmem.alloc_page(&mapper);
        assert_eq!(b.as_u32(), a.as_u32() - 4096);
    }

    #[test]
    #[should_panic(expected = "below the hmem region")]
    fn rejects_foreign_pages() {
        let (_buf, mapper) = harness();
        let mut hmem = HmemAllocator::new(PhysAddr::new(TOP));
        let _ = hmem.alloc_page(&mapper);
        hmem.free_page(&mapper, PhysAddr::new(0x1000));
    }
}
