//! aarch64 4 KiB-granule, 4-level (L0-L3) page table structures and the
//! direct-map-based mapper that walks/builds them.
//!
//! Block descriptors (L1/L2 huge pages) are out of scope: [`map_4k`] only
//! ever writes L3 page descriptors, matching [`cascade_core::arch::Arch::map_range`]'s
//! standard-page-only contract.

use cascade_core::addr::{PhysAddr, VirtAddr};
use cascade_core::frame::{PhysFrame, Size4KiB};

const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Stage 1 translation table descriptor attributes (lower attributes
    /// only; upper attributes like PXN/UXN are not needed by this kernel).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u64 {
        /// Bit 0: entry participates in translation.
        const VALID      = 1 << 0;
        /// Bit 1: table (1) vs block (0) at L0-L2; always 1 for L3 pages.
        const TABLE_OR_PAGE = 1 << 1;
        /// MAIR index 0: normal, write-back cacheable memory.
        const ATTR_NORMAL = 0 << 2;
        /// MAIR index 1: device-nGnRnE memory (MMIO).
        const ATTR_DEVICE = 1 << 2;
        /// AP[2:1] = 01: read/write at EL1, no access at EL0.
        const AP_RW_EL1   = 1 << 6;
        /// Inner shareable.
        const SHAREABLE   = 0b11 << 8;
        /// Access flag; must be set or the first access faults.
        const ACCESS_FLAG = 1 << 10;
        /// Privileged execute-never.
        const PXN         = 1u64 << 53;
        /// Unprivileged execute-never.
        const UXN         = 1u64 << 54;
    }
}

/// A single translation table descriptor (64 bits).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Descriptor(u64);

impl Descriptor {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn new(phys_addr: PhysAddr, flags: DescriptorFlags) -> Self {
        Self((phys_addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    pub const fn is_valid(self) -> bool {
        self.0 & 1 != 0
    }

    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    pub const fn flags(self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }
}

/// A 4 KiB-aligned translation table containing 512 descriptors.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [Descriptor; 512],
}

fn index(virt: VirtAddr, level: u32) -> usize {
    ((virt.as_u64() >> (12 + 9 * (3 - level))) & 0x1ff) as usize
}

/// Walks and builds L0-L3 translation tables via the direct map.
pub struct PageTableMapper {
    hhdm_offset: u64,
}

impl PageTableMapper {
    pub const fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        (self.hhdm_offset + phys.as_u64()) as *mut u8
    }

    /// # Safety
    /// `phys` must be a valid, 4 KiB-aligned table reachable through the
    /// direct map.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: forwarded to the caller's contract.
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// # Safety
    /// `table_phys` must be a valid table reachable through the direct map.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        idx: usize,
        alloc: &mut impl FnMut() -> PhysFrame<Size4KiB>,
    ) -> PhysAddr {
        // SAFETY: forwarded to the caller's contract.
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[idx];
        if entry.is_valid() {
            entry.address()
        } else {
            let new_frame = alloc().start_address();
            // SAFETY: just allocated, reachable through the direct map.
            unsafe {
                core::ptr::write_bytes(self.phys_to_virt(new_frame), 0, 4096);
            }
            table.entries[idx] =
                Descriptor::new(new_frame, DescriptorFlags::VALID | DescriptorFlags::TABLE_OR_PAGE);
            new_frame
        }
    }

    /// Maps a single 4 KiB page, walking L0 -> L1 -> L2 -> L3.
    ///
    /// # Safety
    /// `l0_phys` must be a valid L0 table and `virt_addr` must not already
    /// be mapped to a conflicting frame.
    pub unsafe fn map_4k(
        &self,
        l0_phys: PhysAddr,
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        flags: DescriptorFlags,
        alloc: &mut impl FnMut() -> PhysFrame<Size4KiB>,
    ) {
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let l1 = self.ensure_table(l0_phys, index(virt_addr, 0), alloc);
            let l2 = self.ensure_table(l1, index(virt_addr, 1), alloc);
            let l3 = self.ensure_table(l2, index(virt_addr, 2), alloc);

            let table = self.table_at(l3);
            table.entries[index(virt_addr, 3)] = Descriptor::new(phys_addr, flags);
        }
    }

    /// Clears a present L3 page descriptor, walking L0 -> L1 -> L2 -> L3, and
    /// returns the physical frame it was mapped to. Leaves intermediate
    /// tables in place even if this empties the last leaf under them.
    ///
    /// # Safety
    /// `l0_phys` must be a valid L0 table.
    pub unsafe fn unmap_4k(&self, l0_phys: PhysAddr, virt_addr: VirtAddr) -> Result<PhysAddr, ()> {
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let l1e = self.table_at(l0_phys).entries[index(virt_addr, 0)];
            if !l1e.is_valid() {
                return Err(());
            }
            let l2e = self.table_at(l1e.address()).entries[index(virt_addr, 1)];
            if !l2e.is_valid() {
                return Err(());
            }
            let l3e = self.table_at(l2e.address()).entries[index(virt_addr, 2)];
            if !l3e.is_valid() {
                return Err(());
            }
            let table = self.table_at(l3e.address());
            let idx = index(virt_addr, 3);
            if !table.entries[idx].is_valid() {
                return Err(());
            }
            let phys = table.entries[idx].address();
            table.entries[idx] = Descriptor::empty();
            Ok(phys)
        }
    }

    /// # Safety
    /// `l0_phys` must be a valid L0 table.
    pub unsafe fn is_mapped(&self, l0_phys: PhysAddr, virt_addr: VirtAddr) -> bool {
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let l1e = self.table_at(l0_phys).entries[index(virt_addr, 0)];
            if !l1e.is_valid() {
                return false;
            }
            let l2e = self.table_at(l1e.address()).entries[index(virt_addr, 1)];
            if !l2e.is_valid() {
                return false;
            }
            let l3e = self.table_at(l2e.address()).entries[index(virt_addr, 2)];
            if !l3e.is_valid() {
                return false;
            }
            self.table_at(l3e.address()).entries[index(virt_addr, 3)].is_valid()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrips_address_and_flags() {
        let d = Descriptor::new(PhysAddr::new(0x2000), DescriptorFlags::VALID);
        assert!(d.is_valid());
        assert_eq!(d.address().as_u64(), 0x2000);
    }

    #[test]
    fn empty_descriptor_invalid() {
        assert!(!Descriptor::empty().is_valid());
    }
}
