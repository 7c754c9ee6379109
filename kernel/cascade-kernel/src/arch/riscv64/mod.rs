//! The riscv64 [`cascade_core::arch::Arch`] implementation: `sstatus.SIE`
//! for interrupt masking, `sscratch` holding the per-CPU pointer (per the
//! boot sequencing contract in [`crate::smp`]), and a Sv39 direct-map page
//! table builder.

mod paging;

use core::arch::asm;
use core::sync::atomic::{AtomicU32, Ordering};

use cascade_core::addr::{PhysAddr, PhysicalRange, Range, VirtAddr, VirtualRange};
use cascade_core::arch::{Arch, Cpu, MapError, MapType, PageTable as PageTableTrait};
use cascade_core::exclusion::{ExclusionCounters, ExclusionCpu};
use cascade_core::frame::{PhysFrame, Size4KiB};
use cascade_core::id::CpuId;
use cascade_core::lock::TicketLock;

use crate::arch::ArchError;

pub use paging::PageTable;

/// `sstatus.SIE`: supervisor interrupt enable.
const SSTATUS_SIE: u64 = 1 << 1;

/// A CPU's per-CPU state, reached through `sscratch`, which the bootstrap
/// sequencer points at this hart's slot during per-CPU bring-up.
pub struct KernelCpu {
    id: AtomicU32,
    counters: ExclusionCounters,
}

impl KernelCpu {
    /// Creates per-CPU state carrying `id`.
    pub const fn new(id: CpuId) -> Self {
        Self { id: AtomicU32::new(id.as_u32()), counters: ExclusionCounters::new() }
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

/// Installs `cpu` as the value `current_cpu()` returns on this hart.
///
/// # Safety
/// `cpu` must outlive every future call to `current_cpu` on this hart, and
/// must not already be installed on a different, still-running hart.
pub unsafe fn set_current_cpu(cpu: &'static mut KernelCpu) {
    let ptr = cpu as *mut KernelCpu as u64;
    // SAFETY: forwarded to the caller's contract; `sscratch` is otherwise
    // unused by this kernel while running in S-mode.
    unsafe {
        asm!("csrw sscratch, {}", in(reg) ptr, options(nomem, nostack, preserves_flags));
    }
}

/// A riscv64 Sv39 root page table plus the direct-map offset needed to
/// walk it.
pub struct KernelPageTable {
    root_phys: PhysAddr,
    hhdm_offset: u64,
}

impl KernelPageTable {
    /// Wraps an existing root table.
    pub const fn new(root_phys: PhysAddr, hhdm_offset: u64) -> Self {
        Self { root_phys, hhdm_offset }
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

/// The physical page allocator the riscv64 page-table builder draws
/// intermediate tables from.
pub static PMM: cascade_pmm::Pmm<KernelArch> = cascade_pmm::Pmm::new();

/// The riscv64 architecture.
pub struct KernelArch;

impl Arch for KernelArch {
    type Cpu = KernelCpu;
    type PageTable = KernelPageTable;

    fn disable_interrupts() {
        // SAFETY: clearing SIE in sstatus has no memory effects.
        unsafe {
            asm!("csrc sstatus, {}", in(reg) SSTATUS_SIE, options(nomem, nostack, preserves_flags));
        }
    }

    fn enable_interrupts() {
        // SAFETY: setting SIE in sstatus has no memory effects.
        unsafe {
            asm!("csrs sstatus, {}", in(reg) SSTATUS_SIE, options(nomem, nostack, preserves_flags));
        }
    }

    fn interrupts_enabled() -> bool {
        let sstatus: u64;
        // SAFETY: reading sstatus has no side effects.
        unsafe {
            asm!("csrr {}, sstatus", out(reg) sstatus, options(nomem, nostack, preserves_flags));
        }
        sstatus & SSTATUS_SIE != 0
    }

    fn disable_and_halt() -> ! {
        Self::disable_interrupts();
        loop {
            // SAFETY: `wfi` merely suspends execution until an interrupt.
            unsafe {
                asm!("wfi", options(nomem, nostack, preserves_flags));
            }
        }
    }

    unsafe fn current_cpu() -> &'static mut Self::Cpu {
        let ptr: u64;
        // SAFETY: reading sscratch has no side effects; forwarded to the
        // caller's contract that it was installed via `set_current_cpu`.
        unsafe {
            asm!("csrr {}, sscratch", out(reg) ptr, options(nomem, nostack, preserves_flags));
        }
        // SAFETY: forwarded to the caller's contract.
        unsafe { &mut *(ptr as *mut KernelCpu) }
    }

    fn spin_loop_hint() {
        // SAFETY: `pause` (the Zihintpause hint) has no side effects.
        unsafe {
            asm!(".insn i 0x0F, 0, x0, x0, 0x010", options(nomem, nostack, preserves_flags));
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

        let mut flags = paging::PteFlags::VALID | paging::PteFlags::READ | paging::PteFlags::ACCESSED;
        if map_type.writable {
            flags |= paging::PteFlags::WRITE | paging::PteFlags::DIRTY;
        }
        if map_type.executable {
            flags |= paging::PteFlags::EXECUTE;
        }

        let mapper = paging::PageTableMapper::new(page_table.hhdm_offset);
        let pages = virtual_range.size() / Self::STANDARD_PAGE_SIZE;

        for i in 0..pages {
            let virt =
                VirtAddr::new_truncate(virtual_range.address().as_u64() + i * Self::STANDARD_PAGE_SIZE);
            // SAFETY: `page_table.root_phys` is a valid root table per this
            // function's own caller contract.
            if unsafe { mapper.is_mapped(page_table.root_phys, virt) } {
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
                mapper.map_4k(page_table.root_phys, virt, phys, flags, &mut alloc);
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
            // SAFETY: `page_table.root_phys` is a valid root table per this
            // function's own caller contract.
            let phys = unsafe { mapper.unmap_4k(page_table.root_phys, virt) }.map_err(|()| MapError::NotMapped)?;
            on_unmapped(phys);
        }

        Ok(())
    }
}

/// Returns the Sv39 root table physical address from `satp`, as activated
/// by the boot stub. Used once, to seed [`KERNEL_PAGE_TABLE`] with the
/// table the hart is already running on rather than building a new one.
///
/// # Safety
/// Must run after the boot stub has activated its page table and loaded
/// `satp`, and before `satp` is next written.
pub unsafe fn active_root_phys() -> PhysAddr {
    let satp: u64;
    // SAFETY: reading satp has no side effects.
    unsafe {
        asm!("csrr {}, satp", out(reg) satp, options(nomem, nostack, preserves_flags));
    }
    // PPN field (bits 0..43) gives the frame number; shift to a byte address.
    PhysAddr::new((satp & 0x0000_0FFF_FFFF_FFFF) << 12)
}

/// Verifies the boot handoff left the hart in S-mode with Sv39 paging
/// active, matching what a Limine-class loader promises before jumping to
/// the kernel entry point.
///
/// # Safety
/// Must run before anything else reads `satp`.
pub unsafe fn verify_boot_state() -> Result<(), ArchError> {
    let satp: u64;
    // SAFETY: reading satp has no side effects.
    unsafe {
        asm!("csrr {}, satp", out(reg) satp, options(nomem, nostack, preserves_flags));
    }
    // MODE field (bits 60..63): 8 == Sv39.
    if (satp >> 60) & 0xf == 0 {
        return Err(ArchError::PagingDisabled);
    }
    Ok(())
}
