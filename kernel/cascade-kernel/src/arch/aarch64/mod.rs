//! The aarch64 [`cascade_core::arch::Arch`] implementation: `DAIF`-based
//! interrupt masking, `TPIDR_EL1` as the per-CPU pointer, and an L0-L3
//! direct-map page table builder.

mod paging;

use core::arch::asm;
use core::sync::atomic::Ordering;

use cascade_core::addr::{PhysAddr, PhysicalRange, Range, VirtAddr, VirtualRange};
use cascade_core::arch::{Arch, Cpu, MapError, MapType, PageTable as PageTableTrait};
use cascade_core::exclusion::{ExclusionCounters, ExclusionCpu};
use cascade_core::frame::{PhysFrame, Size4KiB};
use cascade_core::id::CpuId;
use cascade_core::lock::TicketLock;

use crate::arch::ArchError;

pub use paging::PageTable;

/// A CPU's per-CPU state. Reached through `TPIDR_EL1`, which the bootstrap
/// sequencer installs for each CPU during its per-CPU bring-up stage
/// (`msr tpidr_el1, <slot address>`).
pub struct KernelCpu {
    id: core::sync::atomic::AtomicU32,
    counters: ExclusionCounters,
}

impl KernelCpu {
    /// Creates per-CPU state carrying `id`.
    pub const fn new(id: CpuId) -> Self {
        Self { id: core::sync::atomic::AtomicU32::new(id.as_u32()), counters: ExclusionCounters::new() }
    }
}

impl Cpu for KernelCpu {
    fn id(&self) -> CpuId {
        CpuId::new(self.id.load(Ordering::Acquire))
    }
}

impl ExclusionCpu for KernelCpu {
    fn exclusion_counters(&self) -> &ExclusionCounters {
        &self.counters
    }
}

/// Installs `cpu` as the value `current_cpu()` returns on this CPU.
///
/// # Safety
/// `cpu` must outlive every future call to `current_cpu` on this CPU, and
/// must not already be installed on a different, still-running CPU.
pub unsafe fn set_current_cpu(cpu: &'static mut KernelCpu) {
    let ptr = cpu as *mut KernelCpu as u64;
    // SAFETY: forwarded to the caller's contract; TPIDR_EL1 is otherwise
    // unused by this kernel.
    unsafe {
        asm!("msr tpidr_el1, {}", in(reg) ptr, options(nomem, nostack, preserves_flags));
    }
}

/// An aarch64 root translation table (TTBR1_EL1 target) plus the direct-map
/// offset needed to walk it.
pub struct KernelPageTable {
    l0_phys: PhysAddr,
    hhdm_offset: u64,
}

impl KernelPageTable {
    /// Wraps an existing L0 table.
    pub const fn new(l0_phys: PhysAddr, hhdm_offset: u64) -> Self {
        Self { l0_phys, hhdm_offset }
    }
}

impl PageTableTrait for KernelPageTable {}

/// The kernel's own root translation table, installed once the boot stub
/// hands off (see [`crate::init::kernel_init`]'s `HeapInitialized` stage).
/// Behind a lock since the kernel heap's backing `Source` maps into it
/// from ordinary, interruptible context, not just single-threaded boot.
pub static KERNEL_PAGE_TABLE: TicketLock<Option<KernelPageTable>> = TicketLock::new(None);

/// Installs `page_table` as [`KERNEL_PAGE_TABLE`].
///
/// # Safety
/// Must be called exactly once, before any code maps into
/// [`KERNEL_PAGE_TABLE`], and not while holding a live `&mut Cpu` borrow
/// for the current CPU.
pub unsafe fn init_kernel_page_table(page_table: KernelPageTable) {
    // SAFETY: forwarded to the caller's contract.
    let mut slot = unsafe { KERNEL_PAGE_TABLE.lock::<KernelArch>() };
    assert!(slot.is_none(), "kernel page table already installed");
    *slot = Some(page_table);
}

/// The physical page allocator the aarch64 page-table builder draws
/// intermediate tables from.
pub static PMM: cascade_pmm::Pmm<KernelArch> = cascade_pmm::Pmm::new();

/// The aarch64 architecture.
pub struct KernelArch;

impl Arch for KernelArch {
    type Cpu = KernelCpu;
    type PageTable = KernelPageTable;

    fn disable_interrupts() {
        // SAFETY: `daifset` has no memory effects.
        unsafe {
            asm!("msr daifset, #0b1111", options(nomem, nostack, preserves_flags));
        }
    }

    fn enable_interrupts() {
        // SAFETY: `daifclr` has no memory effects.
        unsafe {
            asm!("msr daifclr, #0b1111", options(nomem, nostack, preserves_flags));
        }
    }

    fn interrupts_enabled() -> bool {
        let daif: u64;
        // SAFETY: reading DAIF has no side effects.
        unsafe {
            asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags));
        }
        // IRQ mask is bit 7; interrupts are enabled when it is clear.
        daif & (1 << 7) == 0
    }

    fn disable_and_halt() -> ! {
        Self::disable_interrupts();
        loop {
            // SAFETY: `wfe` merely suspends execution until an event/IRQ.
            unsafe {
                asm!("wfe", options(nomem, nostack, preserves_flags));
            }
        }
    }

    unsafe fn current_cpu() -> &'static mut Self::Cpu {
        let ptr: u64;
        // SAFETY: reading TPIDR_EL1 has no side effects; forwarded to the
        // caller's contract that it was installed via `set_current_cpu`.
        unsafe {
            asm!("mrs {}, tpidr_el1", out(reg) ptr, options(nomem, nostack, preserves_flags));
        }
        // SAFETY: forwarded to the caller's contract.
        unsafe { &mut *(ptr as *mut KernelCpu) }
    }

    fn spin_loop_hint() {
        // SAFETY: `wfe` is a no-op absent a prior `sev`-paired wakeup event.
        unsafe {
            asm!("wfe", options(nomem, nostack, preserves_flags));
        }
    }

    unsafe fn map_range(
        page_table: &mut Self::PageTable,
        virtual_range: VirtualRange,
        physical_range: PhysicalRange,
        map_type: MapType,
    ) -> Result<(), MapError> {
        if virtual_range.size() != physical_range.size() {
            return Err(MapError::MappingNotValid);
        }
        if virtual_range.size() % Self::STANDARD_PAGE_SIZE != 0 {
            return Err(MapError::MappingNotValid);
        }

        let mut flags = paging::DescriptorFlags::VALID
            | paging::DescriptorFlags::TABLE_OR_PAGE
            | paging::DescriptorFlags::ACCESS_FLAG
            | paging::DescriptorFlags::SHAREABLE
            | paging::DescriptorFlags::UXN;
        if map_type.no_cache {
            flags |= paging::DescriptorFlags::ATTR_DEVICE;
        }
        if !map_type.writable {
            // read-only mappings are expressed the same way here; AP bits
            // for read-only are not modeled since nothing in this kernel
            // needs them yet.
        }
        if !map_type.executable {
            flags |= paging::DescriptorFlags::PXN;
        }

        let mapper = paging::PageTableMapper::new(page_table.hhdm_offset);
        let pages = virtual_range.size() / Self::STANDARD_PAGE_SIZE;

        for i in 0..pages {
            let virt =
                VirtAddr::new_truncate(virtual_range.address().as_u64() + i * Self::STANDARD_PAGE_SIZE);
            // SAFETY: `page_table.l0_phys` is a valid root table per this
            // function's own caller contract.
            if unsafe { mapper.is_mapped(page_table.l0_phys, virt) } {
                return Err(MapError::AlreadyMapped);
            }
        }

        let mut alloc = || -> PhysFrame<Size4KiB> {
            // SAFETY: the PMM is initialized before paging is built on top
            // of it; out-of-memory while building page tables is
            // unrecoverable at this point in boot.
            unsafe { PMM.allocate_frame().expect("out of physical memory building page tables") }
        };

        for i in 0..pages {
            let offset = i * Self::STANDARD_PAGE_SIZE;
            let virt = VirtAddr::new_truncate(virtual_range.address().as_u64() + offset);
            let phys = PhysAddr::new(physical_range.address().as_u64() + offset);
            // SAFETY: forwarded to this function's own caller contract.
            unsafe {
                mapper.map_4k(page_table.l0_phys, virt, phys, flags, &mut alloc);
            }
        }

        Ok(())
    }

    unsafe fn unmap_range(
        page_table: &mut Self::PageTable,
        virtual_range: VirtualRange,
        on_unmapped: &mut dyn FnMut(PhysAddr),
    ) -> Result<(), MapError> {
        if virtual_range.size() % Self::STANDARD_PAGE_SIZE != 0 {
            return Err(MapError::MappingNotValid);
        }

        let mapper = paging::PageTableMapper::new(page_table.hhdm_offset);
        let pages = virtual_range.size() / Self::STANDARD_PAGE_SIZE;

        for i in 0..pages {
            let virt =
                VirtAddr::new_truncate(virtual_range.address().as_u64() + i * Self::STANDARD_PAGE_SIZE);
            // SAFETY: `page_table.l0_phys` is a valid root table per this
            // function's own caller contract.
            let phys = unsafe { mapper.unmap_4k(page_table.l0_phys, virt) }.map_err(|()| MapError::NotMapped)?;
            on_unmapped(phys);
        }

        Ok(())
    }
}

/// Returns the L0 translation table physical address from `TTBR1_EL1`, as
/// activated by the boot stub. Used once, to seed [`KERNEL_PAGE_TABLE`]
/// with the table the CPU is already running on rather than building a
/// new one.
///
/// # Safety
/// Must run after the boot stub has activated its translation tables and
/// loaded `TTBR1_EL1`, and before it is next written.
pub unsafe fn active_l0_phys() -> PhysAddr {
    let ttbr1: u64;
    // SAFETY: reading TTBR1_EL1 has no side effects.
    unsafe {
        asm!("mrs {}, ttbr1_el1", out(reg) ttbr1, options(nomem, nostack, preserves_flags));
    }
    PhysAddr::new(ttbr1 & 0x0000_FFFF_FFFF_F000)
}

/// Verifies the boot handoff left the CPU in EL1 with the MMU enabled,
/// matching what a Limine-class loader promises before jumping to the
/// kernel entry point.
///
/// # Safety
/// Must run before anything else reads `SCTLR_EL1`/`CurrentEL`.
pub unsafe fn verify_boot_state() -> Result<(), ArchError> {
    let current_el: u64;
    // SAFETY: reading CurrentEL has no side effects.
    unsafe {
        asm!("mrs {}, CurrentEL", out(reg) current_el, options(nomem, nostack, preserves_flags));
    }
    if (current_el >> 2) & 0b11 != 1 {
        return Err(ArchError::Not64Bit);
    }

    let sctlr: u64;
    // SAFETY: reading SCTLR_EL1 has no side effects.
    unsafe {
        asm!("mrs {}, sctlr_el1", out(reg) sctlr, options(nomem, nostack, preserves_flags));
    }
    if sctlr & 1 == 0 {
        return Err(ArchError::PagingDisabled);
    }

    Ok(())
}
