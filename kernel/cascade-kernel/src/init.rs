//! `kernel_init`: the boot stub's single entry point into the kernel
//! proper, driving the bootstrap executor through every
//! [`crate::smp::BootstrapStage`] in order.
//!
//! Interrupt vector installation, ACPI AML evaluation, and a monotonic
//! timer are out of scope for this kernel (see `spec.md`'s Non-goals); the
//! stages that would configure them are still named and walked through in
//! order, since the sequencing itself — not any one stage's payload — is
//! what the bootstrap tracker enforces.

use core::sync::atomic::{AtomicU32, Ordering};

use cascade_core::addr::{DirectMap, PhysicalRange, VirtAddr};
use cascade_core::arch::Arch;
use cascade_core::kinfo;
use cascade_core::lock::TicketLock;

use crate::arch::KernelArch;
use crate::boot::{BootInfo, MemoryKind};
use crate::heap::KernelHeap;
use crate::smp::{ApStage, BootstrapStage, RendezvousBarrier, StageTracker};

/// Shared rendezvous every peer checks in with before boot is considered
/// complete.
static BARRIER: RendezvousBarrier = RendezvousBarrier::new();

/// Total executor count (bootstrap included), published before any peer is
/// released so [`ap_entry`] knows how many arrivals to wait for.
static TOTAL_EXECUTORS: AtomicU32 = AtomicU32::new(0);

/// Virtual-address span reserved for the kernel heap, just past the direct
/// map so it never collides with it.
const KERNEL_HEAP_SIZE: u64 = 64 * 1024 * 1024;

/// The kernel heap, built during [`BootstrapStage::HeapInitialized`].
static KERNEL_HEAP: TicketLock<Option<KernelHeap<KernelArch>>> = TicketLock::new(None);

/// Drives the bootstrap executor from [`BootstrapStage::Init0`] to
/// [`BootstrapStage::BarrierCompleted`], then parks forever.
///
/// # Safety
/// Must be called exactly once, by the bootstrap executor, immediately
/// after the boot stub finishes building and activating the kernel's page
/// tables, with interrupts still disabled.
pub unsafe fn kernel_init(boot_info: &dyn BootInfo) -> ! {
    let mut stage = StageTracker::<BootstrapStage>::new();

    // SAFETY: forwarded to this function's own caller contract: interrupts
    // disabled, nothing else has read these registers yet.
    unsafe {
        crate::arch::verify_boot_state().expect("boot handoff left the CPU in an unsupported state");
    }
    stage.advance(BootstrapStage::EarlyOutput);

    let direct_map_extent = boot_info
        .memory_map()
        .iter()
        .map(|entry| entry.base.as_u64() + entry.len)
        .max()
        .unwrap_or(0);
    let direct_map = DirectMap {
        virtual_base: VirtAddr::new(boot_info.direct_map_offset()),
        size: direct_map_extent,
    };
    stage.advance(BootstrapStage::OffsetsDetermined);

    // No interrupt vectors are installed by this kernel; nothing to do.
    stage.advance(BootstrapStage::InterruptsCaptured);

    // SAFETY: this is the only CPU running and the PMM has not been
    // initialized yet.
    unsafe {
        crate::arch::PMM.init(direct_map);
        for entry in boot_info.memory_map() {
            if entry.kind != MemoryKind::Free {
                continue;
            }
            let range = PhysicalRange::new(entry.base, entry.len);
            crate::arch::PMM.add_range(range).expect("boot memory map entry is not page-aligned");
        }
    }
    stage.advance(BootstrapStage::PmmInitialized);

    // The boot stub already built and activated the kernel's own page
    // table before calling in here; read it back so later stages (the heap)
    // have a handle to map into.
    // SAFETY: the boot stub activated this table before jumping here, and
    // nothing has written CR3/TTBR1_EL1/satp since.
    let page_table_phys = unsafe { crate::arch::active_kernel_page_table_phys() };
    // SAFETY: called exactly once, before any code maps into
    // `KERNEL_PAGE_TABLE`.
    unsafe {
        crate::arch::init_kernel_page_table(crate::arch::KernelPageTable::new(
            page_table_phys,
            direct_map.virtual_base.as_u64(),
        ));
    }
    stage.advance(BootstrapStage::CorePageTableLoaded);

    // No AML interpreter is wired up; ACPI host glue (see `crate::acpi`)
    // is exercised directly by its own tests instead.
    stage.advance(BootstrapStage::AcpiReady);

    // No timer driver is wired up.
    stage.advance(BootstrapStage::TimeInitialized);

    let heap_base = (direct_map.virtual_base.as_u64() + direct_map.size)
        .next_multiple_of(KernelArch::STANDARD_PAGE_SIZE);
    // SAFETY: the kernel page table and PMM are both initialized by this
    // point in boot, and this is still the only CPU running.
    let kernel_heap =
        unsafe { crate::heap::build_kernel_heap(direct_map, heap_base as usize, KERNEL_HEAP_SIZE as usize) };
    // SAFETY: single-threaded at this point in boot.
    unsafe {
        *KERNEL_HEAP.lock::<KernelArch>() = Some(kernel_heap);
    }
    stage.advance(BootstrapStage::HeapInitialized);
    stage.advance(BootstrapStage::StacksInitialized);
    stage.advance(BootstrapStage::ExecutorsConstructed);

    let peers = boot_info.cpus().len().saturating_sub(1) as u32;
    TOTAL_EXECUTORS.store(peers + 1, Ordering::Release);
    if peers > 0 {
        for cpu in &boot_info.cpus()[1..] {
            // SAFETY: `cpu` was discovered by the bootloader and its
            // park-loop memory is still mapped through the direct map.
            unsafe {
                cpu.boot(ap_entry as usize, 0);
            }
        }
    }
    stage.advance(BootstrapStage::PeersStarted);
    BARRIER.wait_for_bootstrap(peers, KernelArch::spin_loop_hint);

    stage.advance(BootstrapStage::BarrierCompleted);
    kinfo!("initialization complete");
    BARRIER.peer_arrived();

    KernelArch::disable_and_halt();
}

/// Entry point a peer CPU's bootloader-owned park loop jumps to.
///
/// # Safety
/// Must only be reached by a CPU released via [`crate::boot::CpuDescriptor::boot`],
/// running on the same page table the bootstrap executor activated.
extern "C" fn ap_entry(_extra: u64) -> ! {
    let mut stage = StageTracker::<ApStage>::new_ap();
    stage.advance(ApStage::Stage2Entered);
    stage.advance(ApStage::PerCpuConfigured);
    stage.advance(ApStage::Stage3Entered);
    BARRIER.peer_arrived();
    stage.advance(ApStage::Ready);

    let total = TOTAL_EXECUTORS.load(Ordering::Acquire);
    BARRIER.wait_for_peer(total, KernelArch::spin_loop_hint);

    KernelArch::disable_and_halt();
}
