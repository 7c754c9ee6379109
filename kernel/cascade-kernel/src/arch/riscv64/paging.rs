//! riscv64 Sv39, 3-level (VPN[2]/VPN[1]/VPN[0]) page table structures and
//! the direct-map-based mapper that walks/builds them.
//!
//! Only 4 KiB leaf mappings (at the VPN[0] level) are written, matching
//! [`cascade_core::arch::Arch::map_range`]'s standard-page-only contract.

use cascade_core::addr::{PhysAddr, VirtAddr};
use cascade_core::frame::{PhysFrame, Size4KiB};

bitflags::bitflags! {
    /// Sv39 PTE flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Entry participates in translation.
        const VALID    = 1 << 0;
        /// Readable.
        const READ     = 1 << 1;
        /// Writable.
        const WRITE    = 1 << 2;
        /// Executable.
        const EXECUTE  = 1 << 3;
        /// Accessible from U-mode.
        const USER     = 1 << 4;
        /// Access bit; must be set by software on platforms without hardware A/D.
        const ACCESSED = 1 << 6;
        /// Dirty bit; same caveat as `ACCESSED`.
        const DIRTY    = 1 << 7;
    }
}

const PPN_SHIFT: u32 = 10;
const PPN_MASK: u64 = 0x003F_FFFF_FFFF_FC00;

/// A single Sv39 page table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn new(phys_addr: PhysAddr, flags: PteFlags) -> Self {
        Self(((phys_addr.as_u64() >> 12) << PPN_SHIFT) | flags.bits())
    }

    pub const fn is_valid(self) -> bool {
        self.0 & 1 != 0
    }

    /// A pointer-to-table entry has no R/W/X bits set; a leaf has at least
    /// one.
    pub const fn is_leaf(self) -> bool {
        self.0 & (PteFlags::READ.bits() | PteFlags::WRITE.bits() | PteFlags::EXECUTE.bits()) != 0
    }

    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(((self.0 & PPN_MASK) >> PPN_SHIFT) << 12)
    }

    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !PPN_MASK)
    }
}

/// A 4 KiB-aligned page table containing 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [Pte; 512],
}

fn vpn(virt: VirtAddr, level: u32) -> usize {
    ((virt.as_u64() >> (12 + 9 * level)) & 0x1ff) as usize
}

/// Walks and builds Sv39 page tables via the direct map.
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
            table.entries[idx] = Pte::new(new_frame, PteFlags::VALID);
            new_frame
        }
    }

    /// Maps a single 4 KiB page, walking the root table -> level 1 -> level 0.
    ///
    /// # Safety
    /// `root_phys` must be a valid Sv39 root table and `virt_addr` must not
    /// already be mapped to a conflicting frame.
    pub unsafe fn map_4k(
        &self,
        root_phys: PhysAddr,
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        flags: PteFlags,
        alloc: &mut impl FnMut() -> PhysFrame<Size4KiB>,
    ) {
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let l1 = self.ensure_table(root_phys, vpn(virt_addr, 2), alloc);
            let l0 = self.ensure_table(l1, vpn(virt_addr, 1), alloc);

            let table = self.table_at(l0);
            table.entries[vpn(virt_addr, 0)] = Pte::new(phys_addr, flags);
        }
    }

    /// Clears a present leaf PTE, walking the root table -> level 1 ->
    /// level 0, and returns the physical frame it was mapped to. Leaves
    /// intermediate tables in place even if this empties the last leaf
    /// under them.
    ///
    /// # Safety
    /// `root_phys` must be a valid Sv39 root table.
    pub unsafe fn unmap_4k(&self, root_phys: PhysAddr, virt_addr: VirtAddr) -> Result<PhysAddr, ()> {
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let l2e = self.table_at(root_phys).entries[vpn(virt_addr, 2)];
            if !l2e.is_valid() || l2e.is_leaf() {
                return Err(());
            }
            let l1e = self.table_at(l2e.address()).entries[vpn(virt_addr, 1)];
            if !l1e.is_valid() || l1e.is_leaf() {
                return Err(());
            }
            let table = self.table_at(l1e.address());
            let idx = vpn(virt_addr, 0);
            if !table.entries[idx].is_valid() {
                return Err(());
            }
            let phys = table.entries[idx].address();
            table.entries[idx] = Pte::empty();
            Ok(phys)
        }
    }

    /// # Safety
    /// `root_phys` must be a valid Sv39 root table.
    pub unsafe fn is_mapped(&self, root_phys: PhysAddr, virt_addr: VirtAddr) -> bool {
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let l2e = self.table_at(root_phys).entries[vpn(virt_addr, 2)];
            if !l2e.is_valid() || l2e.is_leaf() {
                return l2e.is_valid();
            }
            let l1e = self.table_at(l2e.address()).entries[vpn(virt_addr, 1)];
            if !l1e.is_valid() || l1e.is_leaf() {
                return l1e.is_valid();
            }
            self.table_at(l1e.address()).entries[vpn(virt_addr, 0)].is_valid()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_roundtrips_address_and_flags() {
        let pte = Pte::new(PhysAddr::new(0x3000), PteFlags::VALID | PteFlags::READ);
        assert!(pte.is_valid());
        assert!(pte.is_leaf());
        assert_eq!(pte.address().as_u64(), 0x3000);
    }

    #[test]
    fn pointer_entry_is_not_a_leaf() {
        let pte = Pte::new(PhysAddr::new(0x4000), PteFlags::VALID);
        assert!(pte.is_valid());
        assert!(!pte.is_leaf());
    }
}
