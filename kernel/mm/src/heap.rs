//! Kernel heap size-class policy.
//!
//! Backs `alloc` collections: small allocations are routed to one slab
//! allocator per power-of-two class (16..2048 bytes), larger ones straight
//! to kmem pages. Class slots are aligned to the class size, so any
//! `Layout` whose align does not exceed its rounded size is satisfied.
//! The `GlobalAlloc` adapter registering this as the Rust allocator lives
//! in the kernel crate.

use core::ptr::NonNull;

use crate::layout::Granule;
use crate::slab::{PageSource, SlabAllocator};

/// The slab-backed size classes.
pub const CLASS_SIZES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Where an allocation of a given layout is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapClass {
    /// Slab class index into [`CLASS_SIZES`].
    Slab(usize),
    /// Whole kmem granule.
    Pages(Granule),
}

/// Picks the class for a layout, or `None` when it exceeds 32 KiB.
#[must_use]
pub fn class_for(size: usize, align: usize) -> Option<HeapClass> {
    let need = size.max(align).max(1);
    for (i, &class) in CLASS_SIZES.iter().enumerate() {
        if need <= class {
            return Some(HeapClass::Slab(i));
        }
    }
    // Granules are naturally aligned to their size, so picking one that
    // fits `need` also satisfies the alignment.
    Granule::fitting(need).map(HeapClass::Pages)
}

macro_rules! class_types {
    ($($name:ident = $size:literal;)*) => {
        $(
            #[repr(C, align($size))]
            struct $name([u8; $size]);
        )*
    };
}

class_types! {
    Obj16 = 16;
    Obj32 = 32;
    Obj64 = 64;
    Obj128 = 128;
    Obj256 = 256;
    Obj512 = 512;
    Obj1024 = 1024;
    Obj2048 = 2048;
}

/// The heap: eight class slabs plus a direct page path.
pub struct Heap<P: PageSource + Copy> {
    c16: SlabAllocator<Obj16, P>,
    c32: SlabAllocator<Obj32, P>,
    c64: SlabAllocator<Obj64, P>,
    c128: SlabAllocator<Obj128, P>,
    c256: SlabAllocator<Obj256, P>,
    c512: SlabAllocator<Obj512, P>,
    c1024: SlabAllocator<Obj1024, P>,
    c2048: SlabAllocator<Obj2048, P>,
    pages: P,
}

/// Frees whole-granule allocations back to the page layer.
pub trait PageRecycler {
    /// Returns a granule allocation obtained through the page source.
    fn free_page(&mut self, granule: Granule, addr: usize);
}

impl<P: PageSource + Copy> Heap<P> {
    /// Creates an empty heap drawing pages from `source`.
    pub const fn new(source: P) -> Self {
        Self {
            c16: SlabAllocator::new(source),
            c32: SlabAllocator::new(source),
            c64: SlabAllocator::new(source),
            c128: SlabAllocator::new(source),
            c256: SlabAllocator::new(source),
            c512: SlabAllocator::new(source),
            c1024: SlabAllocator::new(source),
            c2048: SlabAllocator::new(source),
            pages: source,
        }
    }

    /// Allocates `size` bytes aligned to `align`. Returns zero when the
    /// layout exceeds the largest granule.
    pub fn allocate(&mut self, size: usize, align: usize) -> usize {
        match class_for(size, align) {
            Some(HeapClass::Slab(i)) => self.slab_allocate(i),
            Some(HeapClass::Pages(g)) => self.pages.alloc_page(g.size()),
            None => 0,
        }
    }

    fn slab_allocate(&mut self, class: usize) -> usize {
        match class {
            0 => self.c16.allocate_uninit().as_ptr() as usize,
            1 => self.c32.allocate_uninit().as_ptr() as usize,
            2 => self.c64.allocate_uninit().as_ptr() as usize,
            3 => self.c128.allocate_uninit().as_ptr() as usize,
            4 => self.c256.allocate_uninit().as_ptr() as usize,
            5 => self.c512.allocate_uninit().as_ptr() as usize,
            6 => self.c1024.allocate_uninit().as_ptr() as usize,
            7 => self.c2048.allocate_uninit().as_ptr() as usize,
            _ => unreachable!("bad size class"),
        }
    }

    /// Releases an allocation made with the same `size`/`align`.
    ///
    /// Whole-granule allocations go back through `recycler`; slab slots
    /// return to their class allocator.
    ///
    /// # Safety
    ///
    /// `addr` must have come from [`allocate`](Self::allocate) on this
    /// heap with an equivalent layout and must not be used afterwards.
    pub unsafe fn deallocate<R: PageRecycler>(
        &mut self,
        recycler: &mut R,
        addr: usize,
        size: usize,
        align: usize,
    ) {
        match class_for(size, align) {
            // SAFETY: Per contract, `addr` came from the matching class.
            Some(HeapClass::Slab(i)) => unsafe { self.slab_free(i, addr) },
            Some(HeapClass::Pages(g)) => recycler.free_page(g, addr),
            None => unreachable!("deallocating an impossible layout"),
        }
    }

    unsafe fn slab_free(&mut self, class: usize, addr: usize) {
        // SAFETY for all arms: `addr` came from this class's allocator.
        unsafe {
            match class {
                0 => self.c16.free_uninit(NonNull::new_unchecked(addr as *mut Obj16)),
                1 => self.c32.free_uninit(NonNull::new_unchecked(addr as *mut Obj32)),
                2 => self.c64.free_uninit(NonNull::new_unchecked(addr as *mut Obj64)),
                3 => self.c128.free_uninit(NonNull::new_unchecked(addr as *mut Obj128)),
                4 => self.c256.free_uninit(NonNull::new_unchecked(addr as *mut Obj256)),
                5 => self.c512.free_uninit(NonNull::new_unchecked(addr as *mut Obj512)),
                6 => self.c1024.free_uninit(NonNull::new_unchecked(addr as *mut Obj1024)),
                7 => self.c2048.free_uninit(NonNull::new_unchecked(addr as *mut Obj2048)),
                _ => unreachable!("bad size class"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    #[test]
    fn class_selection() {
        assert_eq!(class_for(1, 1), Some(HeapClass::Slab(0)));
        assert_eq!(class_for(16, 8), Some(HeapClass::Slab(0)));
        assert_eq!(class_for(17, 1), Some(HeapClass::Slab(1)));
        assert_eq!(class_for(2048, 1), Some(HeapClass::Slab(7)));
        assert_eq!(class_for(2049, 1), Some(HeapClass::Pages(Granule::K4)));
        assert_eq!(class_for(9000, 1), Some(HeapClass::Pages(Granule::K16)));
        assert_eq!(class_for(32768, 1), Some(HeapClass::Pages(Granule::K32)));
        assert_eq!(class_for(32769, 1), None);
        // Alignment dominates size when larger.
        assert_eq!(class_for(8, 512), Some(HeapClass::Slab(5)));
        assert_eq!(class_for(8, 4096), Some(HeapClass::Pages(Granule::K4)));
    }

    /// Page source for host tests: intentionally leaks, like the kernel's
    /// slab pages that never return to kmem.
    #[derive(Clone, Copy)]
    struct LeakyPages;

    impl PageSource for LeakyPages {
        fn alloc_page(&mut self, size: usize) -> usize {
            let layout = Layout::from_size_align(size, size).unwrap();
            // SAFETY: non-zero size.
            let ptr = unsafe { std::alloc::alloc(layout) };
            assert!(!ptr.is_null());
            ptr as usize
        }
    }

    struct NoRecycle;

    impl PageRecycler for NoRecycle {
        fn free_page(&mut self, _granule: Granule, _addr: usize) {}
    }

    #[test]
    fn slab_round_trip_and_alignment() {
        let mut heap = Heap::new(LeakyPages);

        for (size, align) in [(1, 1), (24, 8), (100, 64), (2000, 16)] {
            let a = heap.allocate(size, align);
            assert_ne!(a, 0);
            assert_eq!(a % align, 0, "{size}/{align} misaligned");
            let b = heap.allocate(size, align);
            assert_ne!(a, b);
            // SAFETY: both allocations came from this heap.
            unsafe {
                heap.deallocate(&mut NoRecycle, a, size, align);
                heap.deallocate(&mut NoRecycle, b, size, align);
            }
            // The class slab reissues its lowest free slot.
            assert_eq!(heap.allocate(size, align), a);
        }
    }

    #[test]
    fn large_layouts_use_pages() {
        let mut heap = Heap::new(LeakyPages);
        let a = heap.allocate(5000, 8);
        assert_eq!(a % 8192, 0, "granule allocations are naturally aligned");
        assert_eq!(heap.allocate(40000, 8), 0, "beyond 32 KiB is refused");
    }
}
