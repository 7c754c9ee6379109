//! The kernel heap: a top-level arena seeded with the kernel's free virtual
//! address range, feeding a second arena whose [`cascade_vmem::Source`]
//! imports by carving a virtual region out of the first and populating it
//! with physical pages mapped through the active [`Arch`]; releasing
//! reverses both steps.
//!
//! This mirrors the way [`cascade_pmm::Pmm`] itself is just a free list of
//! physical frames: the heap is two stacked [`Arena`]s rather than a
//! special-cased allocator, the same composition `Arena::add_span`'s
//! `Source` plumbing was built for.

use cascade_core::arch::Arch;
use cascade_core::exclusion::ExclusionCpu;
use cascade_core::id::TaskId;
use cascade_vmem::{Allocation, Arena, ArenaError, Policy};

#[cfg(target_os = "none")]
pub use physical::build_kernel_heap;

/// A kernel heap: a virtual-address arena backing a byte-granular
/// allocation arena.
///
/// Callers go through [`KernelHeap::allocate`]/[`KernelHeap::deallocate_base`]
/// rather than touching `heap_arena` directly; `current_task` is accepted
/// (and currently unused) so call sites already have the hook a future
/// per-task accounting layer would need.
pub struct KernelHeap<A: Arch>
where
    A::Cpu: ExclusionCpu,
{
    /// The free virtual-address range the heap draws spans from.
    pub vaddr_arena: Arena<A>,
    /// The byte-granular arena callers allocate from.
    pub heap_arena: Arena<A>,
}

impl<A: Arch> KernelHeap<A>
where
    A::Cpu: ExclusionCpu,
{
    /// Wraps an already-constructed pair of arenas. `heap_arena` is expected
    /// to have been built with a [`cascade_vmem::Source`] pointing at
    /// `vaddr_arena`.
    pub fn new(vaddr_arena: Arena<A>, heap_arena: Arena<A>) -> Self {
        Self { vaddr_arena, heap_arena }
    }

    /// Allocates `size` bytes from the heap arena, importing a fresh span
    /// from `vaddr_arena` (and, in the real kernel, backing it with
    /// newly-mapped physical pages) if no free run currently satisfies it.
    ///
    /// # Safety
    /// Same contract as [`cascade_pmm::Pmm::allocate_frame`]: must not be
    /// called while holding a live `&mut Cpu` borrow for the current CPU.
    pub unsafe fn allocate(&self, size: usize, _current_task: TaskId) -> Result<Allocation, ArenaError> {
        // SAFETY: forwarded to the caller's contract.
        unsafe { self.heap_arena.allocate(size, Policy::InstantFit) }
    }

    /// Returns a previously allocated base to the heap arena.
    ///
    /// # Safety
    /// Same contract as [`KernelHeap::allocate`]. `ptr` must have been
    /// returned by `allocate` on this heap and not yet deallocated.
    pub unsafe fn deallocate_base(&self, ptr: usize, _current_task: TaskId) {
        // SAFETY: forwarded to the caller's contract.
        unsafe { self.heap_arena.deallocate_base(ptr) };
    }
}

/// The real kernel heap's physically-backed [`cascade_vmem::Source`]: every
/// span it imports is mapped to freshly allocated physical pages, and every
/// span it releases is unmapped and returns those pages to the PMM.
///
/// Split out from the rest of this module because it reaches into
/// [`crate::arch`], which does not exist under `cargo test` on the host
/// (see `lib.rs`'s module gating) — the generic [`KernelHeap`] above stays
/// host-testable against any `Arch`, backed by the arena's size-agnostic
/// defaults.
#[cfg(target_os = "none")]
mod physical {
    use super::KernelHeap;
    use cascade_core::addr::{DirectMap, PhysAddr, PhysicalRange, VirtAddr, VirtualRange};
    use cascade_core::arch::{Arch, MapType};
    use cascade_core::lock::TicketLock;
    use cascade_vmem::{Allocation, Arena, ArenaError, Policy, Source};

    use crate::arch::{self, KernelArch};

    /// Backing storage for the heap's virtual-address arena. A `static`
    /// rather than a stack value since [`Source::arena`] needs a `'static`
    /// reference to it and the heap is built once, long before any real
    /// allocator exists to leak one from.
    static VADDR_ARENA: TicketLock<Option<Arena<KernelArch>>> = TicketLock::new(None);

    /// Grows the heap arena by carving `len` bytes out of the kernel's free
    /// virtual-address arena and backing every page of the new span with a
    /// freshly allocated physical frame, mapped into
    /// [`arch::KERNEL_PAGE_TABLE`]. Rolls back (unmaps and frees what was
    /// already mapped, releases the virtual span) on partial failure.
    fn physically_backed_import(
        arena: &'static Arena<KernelArch>,
        len: usize,
    ) -> Result<Allocation, ArenaError> {
        // SAFETY: heap growth happens from ordinary, interruptible kernel
        // context, never while holding a live `&mut Cpu` borrow.
        let allocation = unsafe { arena.allocate(len, Policy::InstantFit) }?;
        let pages = allocation.len as u64 / KernelArch::STANDARD_PAGE_SIZE;

        for i in 0..pages {
            let offset = i * KernelArch::STANDARD_PAGE_SIZE;
            let virt = VirtAddr::new_truncate(allocation.base as u64 + offset);

            // SAFETY: the PMM is initialized during `PmmInitialized`, long
            // before the heap is built.
            let frame = match unsafe { arch::PMM.allocate_frame() } {
                Ok(frame) => frame,
                Err(_) => {
                    roll_back(arena, allocation, i);
                    return Err(ArenaError::PhysicalMemoryExhausted);
                }
            };
            let physical_range = PhysicalRange::new(frame.start_address(), KernelArch::STANDARD_PAGE_SIZE);
            let virtual_range = VirtualRange::new(virt, KernelArch::STANDARD_PAGE_SIZE);

            // SAFETY: `arch::KERNEL_PAGE_TABLE` is installed before the
            // heap is built (see `build_kernel_heap`'s own caller
            // contract), and this span was just reserved by `allocate`
            // above, so it cannot already be mapped.
            let map_result = unsafe {
                let mut guard = arch::KERNEL_PAGE_TABLE.lock::<KernelArch>();
                let page_table = guard.as_mut().expect("kernel page table not installed");
                KernelArch::map_range(page_table, virtual_range, physical_range, MapType::READ_WRITE)
            };
            if map_result.is_err() {
                // SAFETY: `frame` was just allocated and never mapped.
                unsafe { arch::PMM.deallocate_page(physical_range) };
                roll_back(arena, allocation, i);
                return Err(ArenaError::PhysicalMemoryExhausted);
            }
        }

        Ok(allocation)
    }

    /// Returns a fully-coalesced imported span's physical pages to the PMM
    /// and unmaps them, then gives the virtual span back to `arena`.
    fn physically_backed_release(arena: &'static Arena<KernelArch>, allocation: Allocation) {
        unmap_and_free(arena, allocation.base, allocation.len as u64);
        // SAFETY: `Source::release` is only ever called from within
        // `Arena::deallocate`, which forwards the same caller contract.
        unsafe { arena.deallocate(allocation) };
    }

    /// Unmaps and frees the first `mapped_pages` pages of `allocation`, then
    /// releases its virtual span back to `arena`. Used when
    /// `physically_backed_import` fails partway through backing a new span.
    fn roll_back(arena: &'static Arena<KernelArch>, allocation: Allocation, mapped_pages: u64) {
        if mapped_pages > 0 {
            unmap_and_free(arena, allocation.base, mapped_pages * KernelArch::STANDARD_PAGE_SIZE);
        }
        // SAFETY: `allocation` was produced by `arena.allocate` in
        // `physically_backed_import` and not yet split or merged.
        unsafe { arena.deallocate(allocation) };
    }

    fn unmap_and_free(_arena: &'static Arena<KernelArch>, base: usize, size: u64) {
        let virtual_range = VirtualRange::new(VirtAddr::new_truncate(base as u64), size);
        let mut free_frame = |phys: PhysAddr| {
            // SAFETY: `phys` was returned by `unmap_4k`, which just cleared
            // the PTE that mapped it; this is the only place a heap-backing
            // frame is returned to the PMM.
            unsafe { arch::PMM.deallocate_page(PhysicalRange::new(phys, KernelArch::STANDARD_PAGE_SIZE)) };
        };
        // SAFETY: `virtual_range` was mapped page-for-page by
        // `physically_backed_import`, which only ever maps standard pages.
        unsafe {
            let mut guard = arch::KERNEL_PAGE_TABLE.lock::<KernelArch>();
            let page_table = guard.as_mut().expect("kernel page table not installed");
            KernelArch::unmap_range(page_table, virtual_range, &mut free_frame)
                .expect("unmap_range: span was mapped page-for-page by this same Source");
        }
    }

    /// Builds the real kernel heap: a free-vaddr arena covering
    /// `[heap_base, heap_base + heap_size)`, feeding a byte-granular arena
    /// backed page-for-page by physical memory via
    /// [`physically_backed_import`]/[`physically_backed_release`].
    ///
    /// # Safety
    /// Must be called exactly once, after [`arch::KERNEL_PAGE_TABLE`] has
    /// been installed and the PMM initialized, and not while holding a live
    /// `&mut Cpu` borrow for the current CPU.
    pub unsafe fn build_kernel_heap(
        direct_map: DirectMap,
        heap_base: usize,
        heap_size: usize,
    ) -> KernelHeap<KernelArch> {
        let pmm = &arch::PMM;

        // SAFETY: forwarded to this function's own caller contract.
        let mut slot = unsafe { VADDR_ARENA.lock::<KernelArch>() };
        assert!(slot.is_none(), "kernel heap vaddr arena already installed");
        *slot = Some(Arena::new(
            "kheap-vaddr",
            KernelArch::STANDARD_PAGE_SIZE as usize,
            pmm,
            direct_map,
            None,
        ));
        let vaddr_arena_ptr = slot.as_ref().unwrap() as *const Arena<KernelArch>;
        drop(slot);
        // SAFETY: `VADDR_ARENA` is a static; once installed above, this
        // entry is never replaced or dropped, so the reference stays valid
        // for the remainder of the program.
        let vaddr_arena: &'static Arena<KernelArch> = unsafe { &*vaddr_arena_ptr };

        // SAFETY: single-threaded at this point in boot.
        unsafe {
            vaddr_arena
                .add_span(heap_base, heap_size)
                .expect("heap virtual-address span overlaps an existing span");
        }

        let source = Source {
            arena: vaddr_arena,
            import: physically_backed_import,
            release: physically_backed_release,
        };
        let heap_arena = Arena::new("kheap", 16, pmm, direct_map, Some(source));

        KernelHeap::new(
            Arena::new("kheap-vaddr-owned", KernelArch::STANDARD_PAGE_SIZE as usize, pmm, direct_map, None),
            heap_arena,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::addr::{DirectMap, PhysAddr, PhysicalRange, VirtAddr, VirtualRange};
    use cascade_core::arch::{Cpu, MapError, MapType, PageTable};
    use cascade_core::exclusion::ExclusionCounters;
    use cascade_core::id::CpuId;
    use cascade_pmm::Pmm;
    use cascade_vmem::Source;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::boxed::Box;

    struct TestCpu {
        counters: ExclusionCounters,
    }
    impl Cpu for TestCpu {
        fn id(&self) -> CpuId {
            CpuId::new(0)
        }
    }
    impl ExclusionCpu for TestCpu {
        fn exclusion_counters(&self) -> &ExclusionCounters {
            &self.counters
        }
    }
    struct TestPageTable;
    impl PageTable for TestPageTable {}

    thread_local! {
        static CPU: TestCpu = TestCpu { counters: ExclusionCounters::new() };
    }

    struct TestArch;
    impl Arch for TestArch {
        type Cpu = TestCpu;
        type PageTable = TestPageTable;
        fn disable_interrupts() {}
        fn enable_interrupts() {}
        fn interrupts_enabled() -> bool {
            true
        }
        fn disable_and_halt() -> ! {
            panic!("halt called in test");
        }
        unsafe fn current_cpu() -> &'static mut Self::Cpu {
            CPU.with(|cpu| {
                let ptr = cpu as *const TestCpu as *mut TestCpu;
                // SAFETY: each test thread owns a distinct thread-local `CPU`.
                unsafe { &mut *ptr }
            })
        }
        fn spin_loop_hint() {
            core::hint::spin_loop();
        }
        unsafe fn map_range(
            _pt: &mut Self::PageTable,
            _v: VirtualRange,
            _p: PhysicalRange,
            _m: MapType,
        ) -> Result<(), MapError> {
            Ok(())
        }
        unsafe fn unmap_range(
            _pt: &mut Self::PageTable,
            _v: VirtualRange,
            _on_unmapped: &mut dyn FnMut(PhysAddr),
        ) -> Result<(), MapError> {
            Ok(())
        }
    }

    struct HostPmm {
        ptr: *mut u8,
        layout: Layout,
        pmm: Pmm<TestArch>,
        direct_map: DirectMap,
    }
    impl Drop for HostPmm {
        fn drop(&mut self) {
            // SAFETY: `ptr`/`layout` match the allocation made in `new`.
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }
    fn leak_pmm(pages: usize) -> (&'static Pmm<TestArch>, DirectMap) {
        const PAGE_SIZE: usize = 4096;
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: non-zero size, valid alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let direct_map = DirectMap {
            virtual_base: VirtAddr::new_truncate(ptr as u64),
            size: (pages * PAGE_SIZE) as u64,
        };
        let pmm: Pmm<TestArch> = Pmm::new();
        // SAFETY: single-threaded test setup.
        unsafe {
            pmm.init(direct_map);
            pmm.add_range(PhysicalRange::new(PhysAddr::zero(), (pages * PAGE_SIZE) as u64))
                .unwrap();
        }
        let boxed = Box::new(HostPmm { ptr, layout, pmm, direct_map });
        let leaked: &'static HostPmm = Box::leak(boxed);
        (&leaked.pmm, direct_map)
    }

    #[test]
    fn allocate_imports_from_vaddr_arena_on_demand() {
        let (pmm, dm) = leak_pmm(16);
        let vaddr_arena: &'static Arena<TestArch> =
            Box::leak(Box::new(Arena::new("kvaddr", 0x1000, pmm, dm, None)));
        // SAFETY: single-threaded test.
        unsafe { vaddr_arena.add_span(0x1_0000_0000, 0x10_0000).unwrap() };

        let heap_arena: Arena<TestArch> =
            Arena::new("kheap", 0x10, pmm, dm, Some(Source::new(vaddr_arena)));
        let heap = KernelHeap::new(Arena::new("kvaddr-owned", 0x1000, pmm, dm, None), heap_arena);

        // SAFETY: single-threaded test.
        unsafe {
            let a = heap.allocate(0x40, TaskId::new(1)).unwrap();
            assert_eq!(a.len, 0x40);
            assert!(vaddr_arena.debug_tags().any(|t| t.kind == cascade_vmem::TagKind::ImportedSpan));
            heap.deallocate_base(a.base, TaskId::new(1));
            assert!(vaddr_arena.debug_tags().all(|t| t.kind != cascade_vmem::TagKind::Allocated));
        }
    }
}
