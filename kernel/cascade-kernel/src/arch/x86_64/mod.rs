//! The x86_64 [`cascade_core::arch::Arch`] implementation: per-CPU state,
//! interrupt control, and a direct-map page table builder.

mod instructions;
pub mod paging;
mod registers;
pub mod serial;

use core::sync::atomic::{AtomicU32, Ordering};

use cascade_core::addr::{PhysAddr, PhysicalRange, Range, VirtAddr, VirtualRange};
use cascade_core::arch::{Arch, Cpu, MapError, MapType, PageTable as PageTableTrait};
use cascade_core::cpu_local::MAX_CPUS;
use cascade_core::exclusion::{ExclusionCounters, ExclusionCpu};
use cascade_core::frame::{PhysFrame, Size4KiB};
use cascade_core::id::CpuId;
use cascade_core::lock::TicketLock;

use crate::arch::ArchError;

pub use paging::{PageTable, PageTableEntry, PageTableFlags, PageTableMapper};

/// Sentinel CPU id, worn by every slot in [`CPUS`] until the bootstrap
/// sequencer assigns a real one during [`ApStage::PerCpuConfigured`].
const UNASSIGNED: u32 = u32::MAX;

/// A CPU's per-CPU state: its logical id and the exclusion counters every
/// `TicketLock` acquisition on this CPU increments and decrements.
pub struct KernelCpu {
    id: AtomicU32,
    counters: ExclusionCounters,
}

impl KernelCpu {
    const fn new() -> Self {
        Self { id: AtomicU32::new(UNASSIGNED), counters: ExclusionCounters::new() }
    }

    /// Assigns this slot's logical CPU id. Called once per CPU, during
    /// per-CPU bring-up, before the slot is reachable from more than one
    /// thread of execution.
    pub fn set_id(&self, id: CpuId) {
        self.id.store(id.as_u32(), Ordering::Release);
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

const NEW_CPU: KernelCpu = KernelCpu::new();
static CPUS: [KernelCpu; MAX_CPUS] = [NEW_CPU; MAX_CPUS];

/// The physical page allocator every CPU's page-table builder draws
/// intermediate tables from. Initialized once, during
/// [`crate::smp::BootstrapStage::PmmInitialized`].
pub static PMM: cascade_pmm::Pmm<KernelArch> = cascade_pmm::Pmm::new();

/// An x86_64 root page table: a PML4 physical frame plus the direct-map
/// offset needed to reach it and its descendants without a recursive
/// mapping.
pub struct KernelPageTable {
    pml4_phys: PhysAddr,
    hhdm_offset: u64,
}

impl KernelPageTable {
    /// Wraps an existing PML4 (e.g. the one the boot stub built and is
    /// already running on).
    pub const fn new(pml4_phys: PhysAddr, hhdm_offset: u64) -> Self {
        Self { pml4_phys, hhdm_offset }
    }
}

impl PageTableTrait for KernelPageTable {}

/// The kernel's own root page table, installed once the boot stub hands
/// off (see [`crate::init::kernel_init`]'s `HeapInitialized` stage).
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

/// The x86_64 architecture.
pub struct KernelArch;

impl Arch for KernelArch {
    type Cpu = KernelCpu;
    type PageTable = KernelPageTable;

    fn disable_interrupts() {
        instructions::disable();
    }

    fn enable_interrupts() {
        // SAFETY: `Arch::enable_interrupts` callers take responsibility for
        // handlers being ready to run; that's this function's whole
        // contract per the trait doc.
        unsafe {
            instructions::enable();
        }
    }

    fn interrupts_enabled() -> bool {
        instructions::are_enabled()
    }

    fn disable_and_halt() -> ! {
        instructions::disable();
        loop {
            // SAFETY: interrupts are masked, so this CPU simply stops until
            // an NMI arrives; that's the intended terminal behavior.
            unsafe {
                instructions::hlt();
            }
        }
    }

    unsafe fn current_cpu() -> &'static mut Self::Cpu {
        let id = cascade_core::cpu_local::current_cpu_id() as usize;
        let slot = if id < MAX_CPUS { id } else { 0 };
        // SAFETY: `CPUS` entries are only ever mutated through their
        // interior atomics; forwarded to the caller's contract on
        // exclusivity of the resulting borrow.
        unsafe { &mut *(&CPUS[slot] as *const KernelCpu as *mut KernelCpu) }
    }

    fn spin_loop_hint() {
        instructions::pause();
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

        let mut flags = PageTableFlags::PRESENT;
        if map_type.writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if map_type.no_cache {
            flags |= PageTableFlags::CACHE_DISABLE;
        }
        if !map_type.executable {
            flags |= PageTableFlags::NO_EXECUTE;
        }

        let mapper = paging::PageTableMapper::new(page_table.hhdm_offset);
        let pages = virtual_range.size() / Self::STANDARD_PAGE_SIZE;

        for i in 0..pages {
            let virt =
                VirtAddr::new_truncate(virtual_range.address().as_u64() + i * Self::STANDARD_PAGE_SIZE);
            // SAFETY: `page_table.pml4_phys` is a valid root table per this
            // function's own caller contract.
            if unsafe { mapper.is_mapped(page_table.pml4_phys, virt) } {
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
                mapper.map_4k(page_table.pml4_phys, virt, phys, flags, &mut alloc);
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
            // SAFETY: `page_table.pml4_phys` is a valid root table per this
            // function's own caller contract.
            let phys = unsafe { mapper.unmap_4k(page_table.pml4_phys, virt) }.map_err(|()| MapError::NotMapped)?;
            on_unmapped(phys);
        }

        Ok(())
    }
}

/// Returns the PML4 physical address from CR3, as activated by the boot
/// stub. Used once, to seed [`KERNEL_PAGE_TABLE`] with the table the CPU is
/// already running on rather than building a new one.
///
/// # Safety
/// Must run after the boot stub has activated its page table and loaded
/// CR3, and before `CR3` is next written.
pub unsafe fn active_pml4_phys() -> PhysAddr {
    PhysAddr::new(registers::read_cr3() & 0x000F_FFFF_FFFF_F000)
}

const CR0_PG: u64 = 1 << 31;
const CR0_WP: u64 = 1 << 16;
const CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

/// Verifies the boot handoff left the CPU in long mode with paging,
/// write-protect enforcement, and PAE all active, matching what a
/// Limine-class loader promises before jumping to the kernel entry point.
///
/// # Safety
/// Must run with interrupts disabled, before anything else reads these
/// same control registers.
pub unsafe fn verify_boot_state() -> Result<(), ArchError> {
    let cr0 = registers::read_cr0();
    if cr0 & CR0_PG == 0 {
        return Err(ArchError::PagingDisabled);
    }
    if cr0 & CR0_WP == 0 {
        return Err(ArchError::RequiredFeatureDisabled);
    }

    let cr4 = registers::read_cr4();
    if cr4 & CR4_PAE == 0 {
        return Err(ArchError::RequiredFeatureDisabled);
    }

    // SAFETY: IA32_EFER exists on every CPU capable of running this kernel.
    let efer = unsafe { registers::read_msr(registers::IA32_EFER) };
    if efer & EFER_LME == 0 || efer & EFER_LMA == 0 {
        return Err(ArchError::Not64Bit);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_slots_start_unassigned() {
        assert_eq!(CPUS[1].id().as_u32(), UNASSIGNED);
    }

    #[test]
    fn set_id_is_visible_through_cpu_trait() {
        let cpu = KernelCpu::new();
        cpu.set_id(CpuId::new(7));
        assert_eq!(cpu.id().as_u32(), 7);
    }
}
