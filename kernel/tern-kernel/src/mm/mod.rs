//! Memory-management wiring: globals, paging, the kernel heap.
//!
//! Owns the kernel page directory and the global kmem/hmem allocator
//! instances (both behind interrupt locks; the allocators must work from
//! interrupt context). Page tables for the whole kmem window are created
//! here at init, so region growth inside the buddy allocator never needs
//! to allocate a table and therefore never re-enters itself.

pub mod scratch;

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;

use tern_core::addr::{KERNEL_BASE, PAGE_SIZE, PhysAddr, VirtAddr};
use tern_core::paging::{PageFlags, PageTable, PageTableEntry};
use tern_core::sync::IntLock;
use tern_core::sync::preempt::{self, PreemptGuard};

use tern_mm::heap::{Heap, PageRecycler};
use tern_mm::hmem::HmemAllocator;
use tern_mm::kmem::{KmemAllocator, KmemParams, RegionBackend};
use tern_mm::layout::{Granule, REGION_SIZE};
use tern_mm::slab::PageSource;

use crate::arch::x86::tlb;
use crate::multiboot::RAM_START;

#[repr(transparent)]
struct SyncUnsafeCell<T>(UnsafeCell<T>);

// SAFETY: The page directory is written during single-threaded init and
// under the KMEM interrupt lock afterwards.
unsafe impl<T> Sync for SyncUnsafeCell<T> {}

/// The kernel page directory; every address space copies its entries.
static FIRST_PAGE_DIRECTORY: SyncUnsafeCell<PageTable> =
    SyncUnsafeCell(UnsafeCell::new(PageTable::empty()));

static KMEM: IntLock<Option<KmemAllocator<PageTableBackend>>> = IntLock::new(None);
static HMEM: IntLock<Option<HmemAllocator>> = IntLock::new(None);

unsafe extern "C" {
    /// End of the kernel image, from the linker script.
    static __kernel_end: u8;
}

/// Maps freshly appended kmem regions. The window's page tables already
/// exist, so this writes leaf entries only and cannot recurse into the
/// allocator.
pub struct PageTableBackend;

impl RegionBackend for PageTableBackend {
    fn map_region(&mut self, virt: usize, phys: PhysAddr) {
        // SAFETY: Called under the KMEM lock; the directory and the
        // pre-created tables are live for the kernel's lifetime.
        let pd = unsafe { &mut *FIRST_PAGE_DIRECTORY.0.get() };
        for i in 0..REGION_SIZE / PAGE_SIZE as usize {
            #[allow(clippy::cast_possible_truncation)]
            let va = VirtAddr::new((virt + i * PAGE_SIZE as usize) as u32);
            let pa = phys + (i as u32) * PAGE_SIZE;
            let pde = pd.entries[va.dir_index()];
            assert!(pde.is_present(), "kmem window table missing");
            // SAFETY: The PDE points at a kmem-window page table.
            let table = unsafe { &mut *pde.addr().to_virt().as_mut_ptr::<PageTable>() };
            table.entries[va.table_index()] =
                PageTableEntry::new(pa, PageFlags::PRESENT | PageFlags::WRITE);
        }
    }
}

/// Maps one page, allocating the page table if the directory slot is
/// empty. `kmem` is borrowed so init can use a not-yet-installed
/// allocator and `map_user_page` the global one.
fn map_page_alloc(
    kmem: &mut KmemAllocator<PageTableBackend>,
    pd: &mut PageTable,
    virt: VirtAddr,
    entry: PageTableEntry,
    pde_flags: PageFlags,
) {
    assert!(virt.is_page_aligned(), "mapping a misaligned address");

    let pde = pd.entries[virt.dir_index()];
    let table = if pde.is_present() {
        pde.addr().to_virt().as_mut_ptr::<PageTable>()
    } else {
        let table = kmem.alloc(Granule::K4) as *mut PageTable;
        // SAFETY: A fresh kmem page owned by this table.
        unsafe { (*table).zero() };
        #[allow(clippy::cast_possible_truncation)]
        let table_phys = PhysAddr::from_kmem(VirtAddr::new(table as u32));
        pd.entries[virt.dir_index()] = PageTableEntry::new(table_phys, pde_flags);
        table
    };
    // SAFETY: `table` points at a live page table.
    unsafe { (*table).entries[virt.table_index()] = entry };
}

/// Initializes paging and both page allocators.
///
/// Runs on the boot mapping: builds the buddy allocator right after the
/// kernel image, maps the kernel window page-by-page into the real
/// directory, switches CR3, then pre-creates page tables for the whole
/// kmem window (they are never freed).
pub fn init(ram_amount: u32) {
    // SAFETY: Taking the address of the linker-provided end symbol.
    let kernel_end = PhysAddr::from_kmem(VirtAddr::from_ptr(unsafe { &raw const __kernel_end }));
    let params = KmemParams::compute(kernel_end, ram_amount);
    // SAFETY: The placement computed from the linker map is backed by
    // RAM, and the first region sits inside the boot mapping.
    let mut kmem = unsafe { KmemAllocator::new(params, PageTableBackend) };

    // SAFETY: Single-threaded early boot.
    let pd = unsafe { &mut *FIRST_PAGE_DIRECTORY.0.get() };
    pd.zero();

    let initially_mapped = kmem.phys_end().to_virt();
    let mut virt = VirtAddr::new(KERNEL_BASE);
    while virt < initially_mapped {
        map_page_alloc(
            &mut kmem,
            pd,
            virt,
            PageTableEntry::new(
                PhysAddr::from_kmem(virt),
                PageFlags::PRESENT | PageFlags::WRITE,
            ),
            PageFlags::PRESENT | PageFlags::WRITE,
        );
        virt = virt + PAGE_SIZE;
    }

    // SAFETY: The directory maps the executing kernel identically to the
    // boot mapping.
    unsafe { tlb::write_cr3(kernel_page_directory_phys()) };

    // Page tables for the rest of the kmem window, up front.
    let window_end = params.region_end.to_virt().as_u32();
    let mut virt = (initially_mapped.as_u32() + (1 << 22) - 1) & !((1 << 22) - 1);
    while virt < window_end {
        let va = VirtAddr::new(virt);
        assert!(!pd.entries[va.dir_index()].is_present());
        let table = kmem.alloc(Granule::K4) as *mut PageTable;
        // SAFETY: Fresh kmem page owned by this table.
        unsafe { (*table).zero() };
        #[allow(clippy::cast_possible_truncation)]
        let table_phys = PhysAddr::from_kmem(VirtAddr::new(table as u32));
        pd.entries[va.dir_index()] =
            PageTableEntry::new(table_phys, PageFlags::PRESENT | PageFlags::WRITE);
        virt += 1 << 22;
    }

    *KMEM.lock() = Some(kmem);
    #[allow(clippy::cast_possible_truncation)]
    let ram_top = PhysAddr::new((RAM_START as u32).saturating_add(ram_amount));
    *HMEM.lock() = Some(HmemAllocator::new(ram_top));
}

/// Physical address of the kernel page directory.
#[must_use]
pub fn kernel_page_directory_phys() -> PhysAddr {
    PhysAddr::from_kmem(VirtAddr::from_ptr(FIRST_PAGE_DIRECTORY.0.get()))
}

/// Runs a closure with the global kmem allocator.
///
/// # Panics
///
/// Panics before [`init`].
pub fn with_kmem<R>(f: impl FnOnce(&mut KmemAllocator<PageTableBackend>) -> R) -> R {
    let mut kmem = KMEM.lock();
    f(kmem.as_mut().expect("kmem not initialized"))
}

/// Allocates one kmem granule (virtually contiguous, identity mapped).
#[must_use]
pub fn kmem_alloc(granule: Granule) -> usize {
    with_kmem(|kmem| kmem.alloc(granule))
}

/// Frees a kmem granule.
pub fn kmem_free(granule: Granule, addr: usize) {
    with_kmem(|kmem| kmem.free(granule, addr));
}

/// Allocates one unmapped physical page from the hmem pool.
///
/// Requires a current task (the free list is threaded through scratch
/// mappings), so it must not be called from interrupt context.
#[must_use]
pub fn hmem_alloc_page() -> PhysAddr {
    preempt::assert_not_interrupt();
    let _no_preempt = PreemptGuard::new();

    let kmem_floor = with_kmem(|kmem| kmem.phys_end());
    let mut hmem = HMEM.lock();
    let hmem = hmem.as_mut().expect("hmem not initialized");
    let page = hmem.alloc_page(&scratch::TaskScratchMapper);
    assert!(
        kmem_floor.as_u32() < hmem.phys_end().as_u32(),
        "kmem and hmem collided"
    );
    page
}

/// Returns a page to the hmem pool.
pub fn hmem_free_page(page: PhysAddr) {
    preempt::assert_not_interrupt();
    let _no_preempt = PreemptGuard::new();

    let mut hmem = HMEM.lock();
    hmem.as_mut()
        .expect("hmem not initialized")
        .free_page(&scratch::TaskScratchMapper, page);
}

/// Maps `phys` at `virt` in the current address space with user access.
pub fn map_user_page(virt: usize, phys: PhysAddr, writable: bool) {
    let mut pte_flags = PageFlags::PRESENT | PageFlags::USER;
    if writable {
        pte_flags |= PageFlags::WRITE;
    }
    let pde_flags = PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER;

    with_kmem(|kmem| {
        // SAFETY: CR3 always points at a live page directory inside the
        // identity-mapped kmem region.
        let pd = unsafe { &mut *tlb::read_cr3().to_virt().as_mut_ptr::<PageTable>() };
        #[allow(clippy::cast_possible_truncation)]
        map_page_alloc(
            kmem,
            pd,
            VirtAddr::new(virt as u32),
            PageTableEntry::new(phys, pte_flags),
            pde_flags,
        );
    });
}

/// Allocates a page directory for a new address space: a copy of the
/// kernel directory, so kernel entries stay identical everywhere.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn new_page_directory() -> PhysAddr {
    let page = kmem_alloc(Granule::K4);
    // SAFETY: Fresh 4 KiB kmem page; the kernel directory is only read.
    unsafe {
        core::ptr::copy_nonoverlapping(
            FIRST_PAGE_DIRECTORY.0.get().cast::<u8>(),
            page as *mut u8,
            PAGE_SIZE as usize,
        );
    }
    PhysAddr::from_kmem(VirtAddr::new(page as u32))
}

// ---------------------------------------------------------------------------
// Kernel heap
// ---------------------------------------------------------------------------

/// Page source feeding the heap's slabs straight from kmem.
#[derive(Clone, Copy)]
struct KmemPages;

impl PageSource for KmemPages {
    fn alloc_page(&mut self, size: usize) -> usize {
        let granule = Granule::fitting(size).expect("slab page beyond 32 KiB");
        kmem_alloc(granule)
    }
}

struct KmemRecycler;

impl PageRecycler for KmemRecycler {
    fn free_page(&mut self, granule: Granule, addr: usize) {
        kmem_free(granule, addr);
    }
}

static HEAP: IntLock<Heap<KmemPages>> = IntLock::new(Heap::new(KmemPages));

struct KernelAllocator;

// SAFETY: Allocation routes through the size-class heap over kmem;
// layouts are reproduced exactly on deallocation per GlobalAlloc's
// contract.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        HEAP.lock().allocate(layout.size().max(1), layout.align()) as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: `ptr` came from `alloc` with the same layout.
        unsafe {
            HEAP.lock().deallocate(
                &mut KmemRecycler,
                ptr as usize,
                layout.size().max(1),
                layout.align(),
            );
        }
    }
}

/// The Rust allocator for the kernel.
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;
