//! x86_64 4-level page table structures and the HHDM-based mapper that
//! walks/builds them.

use cascade_core::addr::{PhysAddr, VirtAddr};
use cascade_core::frame::{PhysFrame, Size4KiB};

/// Physical address mask: bits 12..51 of a page table entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present / valid.
        const PRESENT    = 1 << 0;
        /// Page is writable.
        const WRITABLE   = 1 << 1;
        /// Page is accessible from user mode (ring 3).
        const USER       = 1 << 2;
        /// Cache disabled.
        const CACHE_DISABLE = 1 << 4;
        /// PS bit -- 2 MiB page in PD, 1 GiB page in PDPT.
        const HUGE_PAGE  = 1 << 7;
        /// No-execute bit (requires EFER.NXE).
        const NO_EXECUTE = 1 << 63;
    }
}

/// A single page table entry (64 bits).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys_addr` with the given `flags`.
    pub const fn new(phys_addr: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys_addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Returns the flags portion of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }
}

/// A 4 KiB-aligned page table containing 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Zero-initializes all entries.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

fn pml4_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> 39) & 0x1ff) as usize
}

fn pdpt_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> 30) & 0x1ff) as usize
}

fn pd_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> 21) & 0x1ff) as usize
}

fn pt_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> 12) & 0x1ff) as usize
}

/// Walks and builds x86_64 page tables via the direct map.
///
/// All physical addresses are accessed through `hhdm_offset + phys_addr`.
pub struct PageTableMapper {
    hhdm_offset: u64,
}

impl PageTableMapper {
    /// Creates a new mapper with the given direct-map offset.
    pub const fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        let p = phys.as_u64();
        assert!(
            p <= u64::MAX - self.hhdm_offset,
            "phys_to_virt: {:#x} overflows HHDM offset {:#x}",
            p,
            self.hhdm_offset
        );
        (self.hhdm_offset + p) as *mut u8
    }

    /// # Safety
    /// `phys` must be a valid, 4 KiB-aligned frame reachable through the
    /// direct map.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: forwarded to the caller's contract.
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// Ensures `table[index]` points at a present next-level table,
    /// allocating and zeroing one via `alloc` if it is not.
    ///
    /// # Safety
    /// `table_phys` must be a valid table reachable through the direct map.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate_flags: PageTableFlags,
        alloc: &mut impl FnMut() -> PhysFrame<Size4KiB>,
    ) -> PhysAddr {
        // SAFETY: forwarded to the caller's contract.
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            let combined = entry.flags() | intermediate_flags;
            if combined != entry.flags() {
                table.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            entry.address()
        } else {
            let new_frame = alloc().start_address();
            // SAFETY: the frame was just allocated and is reachable through
            // the direct map; zeroing it keeps stale bytes from ever being
            // read back as present entries.
            unsafe {
                core::ptr::write_bytes(self.phys_to_virt(new_frame), 0, 4096);
            }
            table.entries[index] = PageTableEntry::new(new_frame, intermediate_flags);
            new_frame
        }
    }

    /// Maps a single 4 KiB page, walking PML4 -> PDPT -> PD -> PT and
    /// allocating intermediate tables as needed.
    ///
    /// # Safety
    /// `pml4_phys` must be a valid PML4 table and the caller must ensure
    /// `virt_addr` is not already mapped to a conflicting frame.
    pub unsafe fn map_4k(
        &self,
        pml4_phys: PhysAddr,
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut impl FnMut() -> PhysFrame<Size4KiB>,
    ) {
        let intermediate = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let pdpt_phys = self.ensure_table(pml4_phys, pml4_index(virt_addr), intermediate, alloc);
            let pd_phys = self.ensure_table(pdpt_phys, pdpt_index(virt_addr), intermediate, alloc);
            let pt_phys = self.ensure_table(pd_phys, pd_index(virt_addr), intermediate, alloc);

            let pt = self.table_at(pt_phys);
            pt.entries[pt_index(virt_addr)] = PageTableEntry::new(phys_addr, flags);
        }
    }

    /// Maps a single 2 MiB huge page, walking PML4 -> PDPT -> PD and
    /// allocating intermediate tables as needed. Used by the boot stub to
    /// build the direct map without one 4 KiB leaf per physical frame.
    ///
    /// # Safety
    /// `pml4_phys` must be a valid PML4 table and the caller must ensure
    /// `virt_addr` is not already mapped to a conflicting frame.
    pub unsafe fn map_2mib(
        &self,
        pml4_phys: PhysAddr,
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut impl FnMut() -> PhysFrame<Size4KiB>,
    ) {
        let intermediate = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let pdpt_phys = self.ensure_table(pml4_phys, pml4_index(virt_addr), intermediate, alloc);
            let pd_phys = self.ensure_table(pdpt_phys, pdpt_index(virt_addr), intermediate, alloc);

            let pd = self.table_at(pd_phys);
            pd.entries[pd_index(virt_addr)] = PageTableEntry::new(phys_addr, flags | PageTableFlags::HUGE_PAGE);
        }
    }

    /// Clears a present 4 KiB leaf entry, walking PML4 -> PDPT -> PD -> PT,
    /// and returns the physical frame it was mapped to. Leaves intermediate
    /// tables in place even if this empties the last leaf under them.
    ///
    /// # Safety
    /// `pml4_phys` must be a valid PML4 table.
    pub unsafe fn unmap_4k(&self, pml4_phys: PhysAddr, virt_addr: VirtAddr) -> Result<PhysAddr, ()> {
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let pml4e = self.table_at(pml4_phys).entries[pml4_index(virt_addr)];
            if !pml4e.is_present() {
                return Err(());
            }
            let pdpte = self.table_at(pml4e.address()).entries[pdpt_index(virt_addr)];
            if !pdpte.is_present() || pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(());
            }
            let pde = self.table_at(pdpte.address()).entries[pd_index(virt_addr)];
            if !pde.is_present() || pde.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(());
            }
            let pt = self.table_at(pde.address());
            let idx = pt_index(virt_addr);
            if !pt.entries[idx].is_present() {
                return Err(());
            }
            let phys = pt.entries[idx].address();
            pt.entries[idx] = PageTableEntry::empty();
            Ok(phys)
        }
    }

    /// Returns whether `virt_addr` already has a present 4 KiB leaf entry
    /// under `pml4_phys`. Intermediate levels that are not present count as
    /// not mapped, not an error.
    ///
    /// # Safety
    /// `pml4_phys` must be a valid PML4 table.
    pub unsafe fn is_mapped(&self, pml4_phys: PhysAddr, virt_addr: VirtAddr) -> bool {
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            let pml4e = self.table_at(pml4_phys).entries[pml4_index(virt_addr)];
            if !pml4e.is_present() {
                return false;
            }
            let pdpte = self.table_at(pml4e.address()).entries[pdpt_index(virt_addr)];
            if !pdpte.is_present() || pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
                return pdpte.is_present();
            }
            let pde = self.table_at(pdpte.address()).entries[pd_index(virt_addr)];
            if !pde.is_present() || pde.flags().contains(PageTableFlags::HUGE_PAGE) {
                return pde.is_present();
            }
            self.table_at(pde.address()).entries[pt_index(virt_addr)].is_present()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrips_address_and_flags() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x1234_5000),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
        assert!(entry.is_present());
        assert_eq!(entry.address().as_u64(), 0x1234_5000);
        assert!(entry.flags().contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn empty_entry_not_present() {
        assert!(!PageTableEntry::empty().is_present());
    }

    #[test]
    fn indices_cover_distinct_bit_ranges() {
        let virt = VirtAddr::new_truncate(0x0000_7f80_4020_1000 & 0x0000_ffff_ffff_ffff);
        assert_eq!(pt_index(virt), (virt.as_u64() as usize >> 12) & 0x1ff);
        assert_eq!(pd_index(virt), (virt.as_u64() as usize >> 21) & 0x1ff);
    }
}
