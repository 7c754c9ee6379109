//! The capability surface the core depends on but does not implement.
//!
//! Each supported target (x86_64, aarch64, riscv64) provides a concrete
//! `Arch` implementation under `kernel/cascade-kernel/src/arch`. This trait
//! exists so the rest of the workspace — the ticket lock, the PMM, the
//! resource arena — can be written once and tested on the host without
//! depending on any particular architecture.

use crate::addr::{PhysAddr, PhysicalRange, VirtualRange};
use crate::id::CpuId;
use core::fmt;

/// A CPU, as seen from the code that reads/writes its per-CPU state.
///
/// Implementations are architecture-specific (a GDT/IDT/TSS bundle on
/// x86_64, a scratch register on riscv64, ...); `Arch::current_cpu` hands
/// out `&mut Cpu` references that must never be aliased — callers are
/// required to hold interrupts disabled for the duration of the borrow.
pub trait Cpu {
    /// This CPU's logical id.
    fn id(&self) -> CpuId;
}

/// Page table mapping request flags (cacheability, permissions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapType {
    /// The mapping is writable.
    pub writable: bool,
    /// The mapping is executable.
    pub executable: bool,
    /// The mapping bypasses the cache (for MMIO).
    pub no_cache: bool,
}

impl MapType {
    /// Read-only, non-executable, cached. The safest default.
    pub const READ_ONLY: Self = Self {
        writable: false,
        executable: false,
        no_cache: false,
    };

    /// Read-write, non-executable, cached. Typical kernel data mapping.
    pub const READ_WRITE: Self = Self {
        writable: true,
        executable: false,
        no_cache: false,
    };

    /// Read-write, non-executable, uncached. Typical MMIO mapping.
    pub const MMIO: Self = Self {
        writable: true,
        executable: false,
        no_cache: true,
    };
}

/// Errors surfaced by [`Arch::map_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The virtual range (or part of it) is already mapped.
    AlreadyMapped,
    /// A physical frame could not be allocated while building page tables.
    PhysicalMemoryExhausted,
    /// The request would require splitting an existing huge mapping, which
    /// this routine does not support.
    MappingNotValid,
    /// The virtual range (or part of it) is not mapped.
    NotMapped,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "virtual range already mapped"),
            Self::PhysicalMemoryExhausted => {
                write!(f, "out of physical memory while building page tables")
            }
            Self::MappingNotValid => write!(f, "mapping requires splitting an existing huge page"),
            Self::NotMapped => write!(f, "virtual range is not mapped"),
        }
    }
}

/// Opaque handle to an architecture's root page table.
pub trait PageTable {}

/// The architecture capability surface.
///
/// All operations that touch hardware state (interrupt masking, the
/// current-CPU register, page tables) go through this trait so the rest of
/// the kernel core stays architecture-agnostic.
pub trait Arch {
    /// Concrete per-CPU type returned by [`Arch::current_cpu`].
    type Cpu: Cpu;
    /// Concrete page-table handle type.
    type PageTable: PageTable;

    /// Disables interrupts on the calling CPU.
    fn disable_interrupts();

    /// Enables interrupts on the calling CPU.
    fn enable_interrupts();

    /// Returns whether interrupts are currently enabled on the calling CPU.
    fn interrupts_enabled() -> bool;

    /// Disables interrupts and halts the calling CPU forever.
    fn disable_and_halt() -> !;

    /// Returns a mutable reference to the current CPU's per-CPU state.
    ///
    /// # Safety
    ///
    /// The caller must ensure interrupts are disabled for the duration of
    /// the borrow, since the referent may otherwise be concurrently
    /// accessed by an interrupt handler running on this same CPU.
    unsafe fn current_cpu() -> &'static mut Self::Cpu;

    /// Hints to the CPU that this is a spin-wait loop (`pause`/`wfe`/...).
    fn spin_loop_hint();

    /// The architecture's standard page size, in bytes (always 4 KiB here).
    const STANDARD_PAGE_SIZE: u64 = 4096;

    /// Maps `virtual_range` to `physical_range` using only the standard
    /// page size. Does not flush the TLB. On failure, may leave partial
    /// state — callers must restart init or destroy the page table.
    ///
    /// # Safety
    ///
    /// `page_table` must be a valid, exclusively-owned page table handle,
    /// and both ranges must have equal, standard-page-aligned sizes.
    unsafe fn map_range(
        page_table: &mut Self::PageTable,
        virtual_range: VirtualRange,
        physical_range: PhysicalRange,
        map_type: MapType,
    ) -> Result<(), MapError>;

    /// Unmaps `virtual_range`, previously mapped with [`Arch::map_range`]
    /// using only the standard page size. Does not flush the TLB or free
    /// the physical frames that were behind the mapping; `on_unmapped` is
    /// called once per page, in ascending virtual-address order, with the
    /// physical frame that page was mapped to, so callers (e.g. the kernel
    /// heap's backing [`Source`]) can return it to their allocator.
    ///
    /// # Safety
    ///
    /// `page_table` must be a valid, exclusively-owned page table handle,
    /// and `virtual_range` must have a standard-page-aligned size and be
    /// fully mapped.
    unsafe fn unmap_range(
        page_table: &mut Self::PageTable,
        virtual_range: VirtualRange,
        on_unmapped: &mut dyn FnMut(PhysAddr),
    ) -> Result<(), MapError>;

    /// Like [`Arch::map_range`], but opportunistically uses 2 MiB / 1 GiB
    /// pages where alignment allows. Used only during init.
    ///
    /// # Safety
    ///
    /// Same contract as [`Arch::map_range`].
    unsafe fn map_range_all_page_sizes(
        page_table: &mut Self::PageTable,
        virtual_range: VirtualRange,
        physical_range: PhysicalRange,
        map_type: MapType,
    ) -> Result<(), MapError> {
        // SAFETY: forwarded under the same caller contract.
        unsafe { Self::map_range(page_table, virtual_range, physical_range, map_type) }
    }
}
