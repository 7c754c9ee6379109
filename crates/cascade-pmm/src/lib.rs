//! The physical page-frame allocator.
//!
//! A single-size, ticket-lock-protected LIFO free-list of 4 KiB frames. Free
//! frames are linked through a [`PageNode`] written directly into the first
//! bytes of the frame itself via the direct map — no separate allocation
//! backs the free list, since the PMM is the allocator everything else
//! bootstraps from.
//!
//! Higher-level structure (DMA pools, NUMA awareness, contiguous multi-page
//! blocks) is deliberately out of scope here and is built instead as a
//! `cascade-vmem` arena stacked on top of this allocator.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::ptr::NonNull;

use cascade_core::addr::{DirectMap, PhysAddr, PhysicalRange, Range};
use cascade_core::arch::Arch;
use cascade_core::exclusion::ExclusionCpu;
use cascade_core::frame::{PhysFrame, Size4KiB};
use cascade_core::list::{SinglyLinked, SinglyLinkedList};
use cascade_core::lock::TicketLock;

/// Errors surfaced by the physical memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// `add_range`'s base or size was not a multiple of the standard page
    /// size.
    InvalidRange,
    /// No free frames remain.
    OutOfPhysicalMemory,
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange => write!(f, "physical range is not page-aligned"),
            Self::OutOfPhysicalMemory => write!(f, "out of physical memory"),
        }
    }
}

/// A free-frame list node, written into the first bytes of a free page.
#[repr(C)]
struct PageNode {
    next: core::cell::UnsafeCell<Option<NonNull<PageNode>>>,
}

// SAFETY: a `PageNode` is only ever reachable while its frame is on the
// free list, and the free list is only ever touched under the PMM's lock.
unsafe impl SinglyLinked for PageNode {
    fn next_ptr(node: NonNull<Self>) -> NonNull<Option<NonNull<Self>>> {
        // SAFETY: `node` is valid per `SinglyLinked`'s contract.
        unsafe { NonNull::new_unchecked((*node.as_ptr()).next.get()) }
    }
}

struct PmmState {
    free_list: SinglyLinkedList<PageNode>,
    free_count: usize,
    direct_map: DirectMap,
}

// SAFETY: `PmmState` is only ever accessed through `TicketLock`, which
// serializes access; the raw `PageNode` pointers it holds point into
// physical memory reachable from any CPU via the direct map.
unsafe impl Send for PmmState {}

impl PmmState {
    fn new(direct_map: DirectMap) -> Self {
        Self {
            free_list: SinglyLinkedList::new(),
            free_count: 0,
            direct_map,
        }
    }

    fn add_range(&mut self, range: PhysicalRange, page_size: u64) -> Result<(), PmmError> {
        if !range.address().is_aligned(page_size) || range.size() % page_size != 0 {
            return Err(PmmError::InvalidRange);
        }

        let num_pages = range.size() / page_size;
        for i in 0..num_pages {
            let phys = range.address() + i * page_size;
            let virt = self.direct_map.to_virt(phys);
            let ptr = virt.as_mut_ptr::<PageNode>();
            // SAFETY: `virt` is a direct-mapped, exclusively-owned (not yet
            // handed out) physical page, large enough for a `PageNode`.
            unsafe {
                ptr.write(PageNode {
                    next: core::cell::UnsafeCell::new(None),
                });
                self.free_list.push(NonNull::new_unchecked(ptr));
            }
            self.free_count += 1;
        }
        Ok(())
    }

    fn allocate_page(&mut self, page_size: u64) -> Result<PhysicalRange, PmmError> {
        let node = self.free_list.pop().ok_or(PmmError::OutOfPhysicalMemory)?;
        self.free_count -= 1;
        let virt = cascade_core::addr::VirtAddr::new_truncate(node.as_ptr() as u64);
        let phys = self.direct_map.to_phys(virt);
        Ok(PhysicalRange::new(phys, page_size))
    }

    fn deallocate_page(&mut self, range: PhysicalRange, page_size: u64) {
        cascade_core::assert_unsafe_precondition!(
            range.address().is_aligned(page_size),
            "deallocate_page: address not page-aligned"
        );
        debug_assert_eq!(range.size(), page_size, "deallocate_page: size mismatch");

        let virt = self.direct_map.to_virt(range.address());
        let ptr = virt.as_mut_ptr::<PageNode>();
        // SAFETY: `range` was previously returned by `allocate_page` and is
        // no longer in use by the caller (their contract to uphold).
        unsafe {
            ptr.write(PageNode {
                next: core::cell::UnsafeCell::new(None),
            });
            self.free_list.push(NonNull::new_unchecked(ptr));
        }
        self.free_count += 1;
    }
}

/// A physical page-frame allocator.
///
/// Parameterized by the concrete [`Arch`] so its internal [`TicketLock`]
/// can acquire CPU exclusion; kernels instantiate one concrete `Pmm<KernelArch>`
/// as a `static`.
pub struct Pmm<A: Arch> {
    inner: TicketLock<Option<PmmState>>,
    _marker: core::marker::PhantomData<A>,
}

impl<A: Arch> Pmm<A>
where
    A::Cpu: ExclusionCpu,
{
    /// Creates an uninitialized allocator. Call [`Pmm::init`] before use.
    pub const fn new() -> Self {
        Self {
            inner: TicketLock::new(None),
            _marker: core::marker::PhantomData,
        }
    }

    /// Initializes the allocator with an (initially empty) free list over
    /// the given direct map.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    ///
    /// # Safety
    ///
    /// Same contract as [`TicketLock::lock`]: must not be called while
    /// holding a live `&mut Cpu` borrow for the current CPU.
    pub unsafe fn init(&self, direct_map: DirectMap) {
        // SAFETY: forwarded to the caller's contract.
        let mut state = unsafe { self.inner.lock::<A>() };
        assert!(state.is_none(), "PMM already initialized");
        *state = Some(PmmState::new(direct_map));
    }

    /// Adds a physical range to the free list.
    ///
    /// `range`'s base and size must both be multiples of
    /// `A::STANDARD_PAGE_SIZE`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pmm::init`]. The caller must additionally ensure
    /// `range` describes genuinely free, direct-mapped physical memory not
    /// already tracked by this or any other allocator.
    pub unsafe fn add_range(&self, range: PhysicalRange) -> Result<(), PmmError> {
        // SAFETY: forwarded to the caller's contract.
        let mut state = unsafe { self.inner.lock::<A>() };
        let state = state.as_mut().expect("PMM not initialized");
        state.add_range(range, A::STANDARD_PAGE_SIZE)
    }

    /// Allocates a single page-sized physical range.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pmm::init`].
    pub unsafe fn allocate_page(&self) -> Result<PhysicalRange, PmmError> {
        // SAFETY: forwarded to the caller's contract.
        let mut state = unsafe { self.inner.lock::<A>() };
        let state = state.as_mut().expect("PMM not initialized");
        state.allocate_page(A::STANDARD_PAGE_SIZE)
    }

    /// Allocates a single page as a [`PhysFrame`], for callers (the resource
    /// arena's tag supply) that want frame-typed handles rather than a
    /// general range.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pmm::init`].
    pub unsafe fn allocate_frame(&self) -> Result<PhysFrame<Size4KiB>, PmmError> {
        // SAFETY: forwarded to the caller's contract.
        let range = unsafe { self.allocate_page()? };
        Ok(PhysFrame::from_start_address(range.address()))
    }

    /// Returns a single page-sized physical range to the free list.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pmm::init`]. `range` must have been returned by
    /// [`Pmm::allocate_page`] (or equivalent) and must not still be in use.
    pub unsafe fn deallocate_page(&self, range: PhysicalRange) {
        cascade_core::assert_unsafe_precondition!(
            range.size() == A::STANDARD_PAGE_SIZE,
            "deallocate_page: range is not a single standard page"
        );
        // SAFETY: forwarded to the caller's contract.
        let mut state = unsafe { self.inner.lock::<A>() };
        let state = state.as_mut().expect("PMM not initialized");
        state.deallocate_page(range, A::STANDARD_PAGE_SIZE);
    }

    /// Returns the number of currently free frames.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pmm::init`].
    pub unsafe fn free_frames(&self) -> usize {
        // SAFETY: forwarded to the caller's contract.
        let state = unsafe { self.inner.lock::<A>() };
        state.as_ref().expect("PMM not initialized").free_count
    }
}

impl<A: Arch> Default for Pmm<A>
where
    A::Cpu: ExclusionCpu,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::addr::{PhysicalRange, VirtAddr, VirtualRange};
    use cascade_core::arch::{Cpu, MapError, MapType, PageTable};
    use cascade_core::exclusion::ExclusionCounters;
    use cascade_core::id::CpuId;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

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

    const PAGE_SIZE: usize = 4096;

    /// Allocates `n` page-aligned host pages and returns a fake direct map
    /// whose virtual base makes `to_virt`/`to_phys` resolve to them, plus
    /// the backing allocation (kept alive for the test's duration) and the
    /// physical range covering all `n` pages (phys base 0).
    struct HostBackedRange {
        ptr: *mut u8,
        layout: Layout,
        direct_map: DirectMap,
        phys_range: PhysicalRange,
    }

    impl Drop for HostBackedRange {
        fn drop(&mut self) {
            // SAFETY: `ptr`/`layout` match the allocation made in `new`.
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn host_backed_range(pages: usize) -> HostBackedRange {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: non-zero size, valid alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let direct_map = DirectMap {
            virtual_base: VirtAddr::new_truncate(ptr as u64),
            size: (pages * PAGE_SIZE) as u64,
        };
        let phys_range = PhysicalRange::new(PhysAddr::zero(), (pages * PAGE_SIZE) as u64);
        HostBackedRange {
            ptr,
            layout,
            direct_map,
            phys_range,
        }
    }

    #[test]
    fn add_range_rejects_misaligned() {
        let backing = host_backed_range(1);
        let pmm: Pmm<TestArch> = Pmm::new();
        // SAFETY: single-threaded test.
        unsafe { pmm.init(backing.direct_map) };
        let bad = PhysicalRange::new(PhysAddr::new(1), 4096);
        // SAFETY: same.
        assert_eq!(unsafe { pmm.add_range(bad) }, Err(PmmError::InvalidRange));
    }

    #[test]
    fn allocate_and_deallocate_roundtrip() {
        let backing = host_backed_range(4);
        let pmm: Pmm<TestArch> = Pmm::new();
        // SAFETY: single-threaded test.
        unsafe {
            pmm.init(backing.direct_map);
            pmm.add_range(backing.phys_range).unwrap();
        }
        // SAFETY: same.
        assert_eq!(unsafe { pmm.free_frames() }, 4);

        // SAFETY: same.
        let a = unsafe { pmm.allocate_page() }.unwrap();
        // SAFETY: same.
        assert_eq!(unsafe { pmm.free_frames() }, 3);

        // SAFETY: `a` was just allocated and is not in use.
        unsafe { pmm.deallocate_page(a) };
        // SAFETY: same.
        assert_eq!(unsafe { pmm.free_frames() }, 4);
    }

    #[test]
    fn allocations_are_distinct_and_page_aligned() {
        let backing = host_backed_range(8);
        let pmm: Pmm<TestArch> = Pmm::new();
        // SAFETY: single-threaded test.
        unsafe {
            pmm.init(backing.direct_map);
            pmm.add_range(backing.phys_range).unwrap();
        }
        let mut seen = HashSet::new();
        for _ in 0..8 {
            // SAFETY: same.
            let range = unsafe { pmm.allocate_page() }.unwrap();
            assert!(range.address().is_aligned(PAGE_SIZE as u64));
            assert!(seen.insert(range.address().as_u64()));
        }
        // SAFETY: same.
        assert_eq!(unsafe { pmm.allocate_page() }, Err(PmmError::OutOfPhysicalMemory));
    }

    /// S5 — PMM stress: 8 workers each doing 100 alloc/free pairs (scaled
    /// down from the scenario's 100 000 for test runtime) against a 256-page
    /// seed, observing no address held by two workers at once and the free
    /// count restored at the end.
    #[test]
    fn pmm_stress_no_double_allocation() {
        let backing = host_backed_range(256);
        let pmm = Arc::new({
            let pmm: Pmm<TestArch> = Pmm::new();
            // SAFETY: single-threaded setup before any worker starts.
            unsafe {
                pmm.init(backing.direct_map);
                pmm.add_range(backing.phys_range).unwrap();
            }
            pmm
        });
        let held: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pmm = Arc::clone(&pmm);
                let held = Arc::clone(&held);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        // SAFETY: each OS thread stands in for a distinct CPU
                        // via its own thread-local `TestCpu`.
                        let range = loop {
                            if let Ok(r) = unsafe { pmm.allocate_page() } {
                                break r;
                            }
                            std::thread::yield_now();
                        };
                        let addr = range.address().as_u64();
                        assert!(held.lock().unwrap().insert(addr), "double allocation of {addr:#x}");
                        std::thread::yield_now();
                        assert!(held.lock().unwrap().remove(&addr));
                        // SAFETY: just removed from `held`; exclusively ours.
                        unsafe { pmm.deallocate_page(range) };
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        // SAFETY: all workers have joined.
        assert_eq!(unsafe { pmm.free_frames() }, 256);
    }
}
