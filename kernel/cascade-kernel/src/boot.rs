//! Bootloader-agnostic boot information.
//!
//! Defines the [`BootInfo`] trait a concrete boot stub (the Limine entry
//! point, a future UEFI stub) implements by translating its own native
//! structures into these types before calling into the rest of the kernel.
//! A fixed-capacity container, [`BootInfoData`], is provided so a stub can
//! build one on the stack without an allocator.

use cascade_core::addr::PhysAddr;
use planck_noalloc::vec::ArrayVec;

/// The kind of a physical memory region, projected down from whatever
/// vocabulary the bootloader uses to the four kinds the kernel actually
/// treats differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Usable RAM, free for the page allocator.
    Free,
    /// Already spoken for: the kernel image, loaded modules, or a
    /// framebuffer.
    InUse,
    /// Reserved by firmware/hardware, or flagged defective. Never used.
    ReservedOrUnusable,
    /// Owned by the bootloader or firmware tables until the kernel is done
    /// reading them, then foldable into the free pool.
    Reclaimable,
}

/// A contiguous physical memory region from the boot-time memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    /// Physical start address.
    pub base: PhysAddr,
    /// Length in bytes.
    pub len: u64,
    /// What this region holds.
    pub kind: MemoryKind,
}

/// Maximum number of memory map entries a [`BootInfoData`] can hold.
pub const MAX_MEMORY_MAP_ENTRIES: usize = 256;

/// Maximum number of CPU descriptors a [`BootInfoData`] can hold.
pub const MAX_CPUS: usize = cascade_core::cpu_local::MAX_CPUS;

/// One CPU the bootloader discovered, with the hook needed to start it.
///
/// `goto_address_ptr`/`extra_argument_ptr` point into bootloader-owned
/// memory (Limine's `mp_response` entries work this way): writing the
/// extra argument and then the entry address atomically releases the AP
/// from its bootloader-supplied spin loop.
#[derive(Debug, Clone, Copy)]
pub struct CpuDescriptor {
    /// Bootloader- or firmware-assigned processor id (LAPIC id on x86_64,
    /// MPIDR on aarch64, hart id on RISC-V).
    pub processor_id: u32,
    /// Pointer to the goto-address cell in bootloader-owned memory.
    pub goto_address_ptr: *mut u64,
    /// Pointer to the extra-argument cell in bootloader-owned memory.
    pub extra_argument_ptr: *mut u64,
}

// SAFETY: the pointed-to memory is bootloader-owned and reachable from any
// CPU through the direct map.
unsafe impl Send for CpuDescriptor {}
// SAFETY: see above; no interior mutation happens except through `boot`,
// which uses volatile writes.
unsafe impl Sync for CpuDescriptor {}

impl CpuDescriptor {
    /// Starts this CPU running `entry` with `extra` passed through the
    /// bootloader's argument cell.
    ///
    /// # Safety
    /// `entry` must be the address of a valid `extern "C" fn(u64) -> !`
    /// that this CPU can execute, and the bootloader-owned memory backing
    /// this descriptor's pointers must still be mapped.
    pub unsafe fn boot(&self, entry: usize, extra: u64) {
        use core::sync::atomic::{fence, Ordering};
        // SAFETY: forwarded to the caller's contract. The extra argument is
        // written and fenced before the entry address, so the AP never
        // observes a stale argument after jumping.
        unsafe {
            core::ptr::write_volatile(self.extra_argument_ptr, extra);
            fence(Ordering::Release);
            core::ptr::write_volatile(self.goto_address_ptr, entry as u64);
        }
    }
}

/// Bootloader-agnostic boot information, as handed to [`crate::smp`]'s
/// bootstrap sequencer.
pub trait BootInfo {
    /// Physical memory map, sorted by base address.
    fn memory_map(&self) -> &[MemoryMapEntry];

    /// The direct-map (HHDM) offset: `virtual = physical + offset`.
    fn direct_map_offset(&self) -> u64;

    /// Physical base address the kernel image was loaded at.
    fn kernel_physical_base(&self) -> PhysAddr;

    /// Virtual base address the kernel image was linked at.
    fn kernel_virtual_base(&self) -> u64;

    /// Every CPU the bootloader discovered, bootstrap CPU included.
    fn cpus(&self) -> &[CpuDescriptor];

    /// ACPI RSDP physical address, if the platform has one.
    fn rsdp_address(&self) -> Option<PhysAddr>;
}

/// A concrete, fixed-capacity [`BootInfo`], populated on the stack by a
/// boot stub before paging/heap are available.
pub struct BootInfoData {
    /// Physical memory map.
    pub memory_map: ArrayVec<MemoryMapEntry, MAX_MEMORY_MAP_ENTRIES>,
    /// Direct-map offset.
    pub direct_map_offset: u64,
    /// Kernel physical load base.
    pub kernel_physical_base: PhysAddr,
    /// Kernel virtual load base.
    pub kernel_virtual_base: u64,
    /// Discovered CPUs.
    pub cpus: ArrayVec<CpuDescriptor, MAX_CPUS>,
    /// ACPI RSDP address, if present.
    pub rsdp_address: Option<PhysAddr>,
}

impl BootInfo for BootInfoData {
    fn memory_map(&self) -> &[MemoryMapEntry] {
        &self.memory_map
    }

    fn direct_map_offset(&self) -> u64 {
        self.direct_map_offset
    }

    fn kernel_physical_base(&self) -> PhysAddr {
        self.kernel_physical_base
    }

    fn kernel_virtual_base(&self) -> u64 {
        self.kernel_virtual_base
    }

    fn cpus(&self) -> &[CpuDescriptor] {
        &self.cpus
    }

    fn rsdp_address(&self) -> Option<PhysAddr> {
        self.rsdp_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BootInfoData {
        let mut memory_map = ArrayVec::new();
        memory_map.insert(
            0,
            MemoryMapEntry { base: PhysAddr::zero(), len: 0x10_0000, kind: MemoryKind::Free },
        );
        BootInfoData {
            memory_map,
            direct_map_offset: 0xffff_8000_0000_0000,
            kernel_physical_base: PhysAddr::new(0x20_0000),
            kernel_virtual_base: 0xffff_ffff_8000_0000,
            cpus: ArrayVec::new(),
            rsdp_address: Some(PhysAddr::new(0xe_0000)),
        }
    }

    #[test]
    fn boot_info_data_reports_back_what_was_stored() {
        let info = sample();
        assert_eq!(info.memory_map().len(), 1);
        assert_eq!(info.memory_map()[0].kind, MemoryKind::Free);
        assert_eq!(info.direct_map_offset(), 0xffff_8000_0000_0000);
        assert_eq!(info.rsdp_address(), Some(PhysAddr::new(0xe_0000)));
        assert!(info.cpus().is_empty());
    }
}
