//! Limine boot stub for CascadeOS.
//!
//! This crate is the Limine-specific entry point: it declares Limine
//! protocol requests, converts the bootloader's responses into
//! [`cascade_kernel::boot::BootInfoData`], builds the kernel's own page
//! tables with a bump allocator (no heap exists yet), switches CR3, parks
//! any secondary CPUs on the new tables, and calls
//! [`cascade_kernel::init::kernel_init`].

#![no_std]
#![no_main]

mod requests;

use requests::REQUESTS;

use cascade_core::addr::PhysAddr;
use cascade_core::addr::VirtAddr;
use cascade_core::frame::{PhysFrame, Size4KiB};
use cascade_kernel::arch::x86_64::paging::{PageTable, PageTableFlags, PageTableMapper};
use cascade_kernel::boot::{BootInfoData, CpuDescriptor, MemoryKind, MemoryMapEntry, MAX_CPUS, MAX_MEMORY_MAP_ENTRIES};
use planck_noalloc::vec::ArrayVec;

unsafe extern "C" {
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __data_start: u8;
    static __data_end: u8;
}

// ---------------------------------------------------------------------------
// Bump frame allocator
// ---------------------------------------------------------------------------

/// Hands out zeroed 4 KiB frames from a single usable memory-map region,
/// counting down from its top. There is no heap yet, so the page table
/// builder cannot draw from [`cascade_kernel::arch::x86_64::PMM`] (which is
/// itself seeded from this same region once boot hands control to
/// `kernel_init`).
struct BumpFrameAllocator {
    next: u64,
    limit: u64,
    hhdm_offset: u64,
    count: u64,
}

impl BumpFrameAllocator {
    fn new(region_start: u64, region_end: u64, hhdm_offset: u64) -> Self {
        Self { next: region_end, limit: region_start, hhdm_offset, count: 0 }
    }

    fn alloc_frame(&mut self) -> PhysFrame<Size4KiB> {
        assert!(self.next >= self.limit + 0x1000, "out of page table frames");
        self.next -= 0x1000;
        self.count += 1;
        let virt = (self.hhdm_offset + self.next) as *mut u8;
        // SAFETY: `self.next` falls within the usable region backing the
        // direct map, which is mapped identically by the bootloader and by
        // the tables being built here.
        unsafe { core::ptr::write_bytes(virt, 0, 0x1000) };
        PhysFrame::containing_address(PhysAddr::new(self.next))
    }
}

/// Limine entry point. Called once, by the bootloader, with the `REQUESTS`
/// struct already populated. Never returns.
#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    // SAFETY: the very first thing this CPU does; nothing else has touched
    // COM1 or the logging facade yet.
    unsafe {
        cascade_kernel::arch::x86_64::serial::init_early_serial();
    }

    assert!(REQUESTS.base_revision.is_supported(), "unsupported Limine base revision");
    cascade_core::kinfo!("CascadeOS booting with Limine...");

    let hhdm_offset = REQUESTS.hhdm.response().expect("HHDM response not available").hhdm_base;

    let memmap_response = REQUESTS.memmap.response().expect("memory map response not available");

    let exec_addr =
        REQUESTS.executable_address.response().expect("executable address response not available");
    let kernel_phys_base = PhysAddr::new(exec_addr.phys_base);
    let kernel_virt_base = VirtAddr::new(exec_addr.virt_base);

    let mut largest_start = 0u64;
    let mut largest_size = 0u64;
    for entry in memmap_response.entries() {
        if entry.type_ == limine::memmap::MemMapEntryType::Usable && entry.length > largest_size {
            largest_start = entry.base;
            largest_size = entry.length;
        }
    }
    assert!(largest_size >= 0x10_0000, "no large usable memory region");

    let mut alloc = BumpFrameAllocator::new(largest_start, largest_start + largest_size, hhdm_offset);

    let pml4_phys =
        build_page_tables(hhdm_offset, memmap_response, kernel_phys_base, kernel_virt_base, &mut alloc);

    let frames_used = alloc.count;
    cascade_core::kdebug!(
        "page tables built: PML4 @ {}, {} frames ({} KiB)",
        pml4_phys,
        frames_used,
        frames_used * 4
    );

    // SAFETY: EFER.NXE/CR4.PGE/CR0.WP/PAT are only ever touched here, before
    // the new tables are activated.
    unsafe {
        set_cpu_control_bits();
    }

    cascade_core::kdebug!("switching CR3 to {}...", pml4_phys);
    // SAFETY: `pml4_phys` was just built above and maps the HHDM, the kernel
    // image, and identity-maps the first 2 MiB so this instruction's own
    // fetch continues uninterrupted across the switch.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) pml4_phys.as_u64(), options(nostack, preserves_flags));
    }
    cascade_core::kdebug!("CR3 switched to kernel-owned page tables");

    let cpus = build_cpus();

    let memory_map = build_memory_map(memmap_response, largest_start, largest_size, frames_used);

    let rsdp_address = REQUESTS.rsdp.response().map(|r| PhysAddr::new(r.rsdp_addr - hhdm_offset));

    let boot_info = BootInfoData {
        memory_map,
        direct_map_offset: hhdm_offset,
        kernel_physical_base: kernel_phys_base,
        kernel_virtual_base: kernel_virt_base.as_u64(),
        cpus,
        rsdp_address,
    };

    log_boot_info(&boot_info);

    // SAFETY: called exactly once, with the kernel's own page table already
    // active and interrupts still disabled since CPU reset.
    unsafe {
        cascade_kernel::init::kernel_init(&boot_info);
    }
}

// ---------------------------------------------------------------------------
// Page table construction
// ---------------------------------------------------------------------------

fn build_page_tables(
    hhdm_offset: u64,
    memmap_response: &limine::MemMapResponse,
    kernel_phys_base: PhysAddr,
    kernel_virt_base: VirtAddr,
    alloc: &mut BumpFrameAllocator,
) -> PhysAddr {
    let mapper = PageTableMapper::new(hhdm_offset);
    let pml4_phys = alloc.alloc_frame().start_address();
    // SAFETY: the frame was just allocated and zeroed by `alloc_frame`.
    unsafe {
        (&mut *((hhdm_offset + pml4_phys.as_u64()) as *mut PageTable)).zero();
    }

    let mut max_phys: u64 = 0;
    for entry in memmap_response.entries() {
        let end = entry.base + entry.length;
        if end > max_phys {
            max_phys = end;
        }
    }
    let max_phys = (max_phys + 0x1F_FFFF) & !0x1F_FFFF;
    let hhdm_pages = max_phys / 0x20_0000;
    cascade_core::kdebug!(
        "mapping HHDM: {} MiB physical address space ({} x 2 MiB pages)",
        max_phys / (1024 * 1024),
        hhdm_pages
    );

    let hhdm_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    let mut phys = 0u64;
    while phys < max_phys {
        let virt = VirtAddr::new_truncate(hhdm_offset + phys);
        // SAFETY: `pml4_phys` was just allocated above and nothing else
        // touches it concurrently.
        unsafe {
            mapper.map_2mib(pml4_phys, virt, PhysAddr::new(phys), hhdm_flags, &mut || alloc.alloc_frame());
        }
        phys += 0x20_0000;
    }

    let text_start = VirtAddr::new(core::ptr::addr_of!(__text_start) as u64);
    let text_end = VirtAddr::new(core::ptr::addr_of!(__text_end) as u64);
    let rodata_start = VirtAddr::new(core::ptr::addr_of!(__rodata_start) as u64);
    let rodata_end = VirtAddr::new(core::ptr::addr_of!(__rodata_end) as u64);
    let data_start = VirtAddr::new(core::ptr::addr_of!(__data_start) as u64);
    let data_end = VirtAddr::new(core::ptr::addr_of!(__data_end) as u64);

    let text_flags = PageTableFlags::PRESENT;
    map_kernel_range(&mapper, pml4_phys, text_start, text_end, kernel_phys_base, kernel_virt_base, text_flags, alloc);

    let rodata_flags = PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE;
    map_kernel_range(
        &mapper,
        pml4_phys,
        rodata_start,
        rodata_end,
        kernel_phys_base,
        kernel_virt_base,
        rodata_flags,
        alloc,
    );

    let data_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    map_kernel_range(&mapper, pml4_phys, data_start, data_end, kernel_phys_base, kernel_virt_base, data_flags, alloc);

    // Identity-map the first 2 MiB so the CR3 switch's own instruction fetch
    // continues without a gap.
    let identity_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    // SAFETY: as above.
    unsafe {
        mapper.map_2mib(pml4_phys, VirtAddr::zero(), PhysAddr::zero(), identity_flags, &mut || {
            alloc.alloc_frame()
        });
    }

    pml4_phys
}

/// Maps a kernel section range using 4 KiB pages, for permissions finer
/// than the HHDM's blanket read-write-no-execute mapping.
fn map_kernel_range(
    mapper: &PageTableMapper,
    pml4_phys: PhysAddr,
    virt_start: VirtAddr,
    virt_end: VirtAddr,
    kernel_phys_base: PhysAddr,
    kernel_virt_base: VirtAddr,
    flags: PageTableFlags,
    alloc: &mut BumpFrameAllocator,
) {
    let start = virt_start.align_down(0x1000);
    let end = virt_end.align_up(0x1000);

    let mut virt = start.as_u64();
    let end_val = end.as_u64();
    while virt < end_val {
        let phys = PhysAddr::new((virt - kernel_virt_base.as_u64()) + kernel_phys_base.as_u64());
        // SAFETY: `pml4_phys` is the table under construction; nothing else
        // touches it concurrently.
        unsafe {
            mapper.map_4k(pml4_phys, VirtAddr::new(virt), phys, flags, &mut || alloc.alloc_frame());
        }
        virt += 0x1000;
    }
}

// ---------------------------------------------------------------------------
// CPU control bits
// ---------------------------------------------------------------------------

/// Enables EFER.NXE (so [`PageTableFlags::NO_EXECUTE`] is honored), CR4.PGE,
/// CR0.WP, and repurposes PAT entry 4 for write-combining.
///
/// # Safety
/// Must run once, before the new page tables (which rely on NX and the PAT
/// remap) are activated.
unsafe fn set_cpu_control_bits() {
    // SAFETY: forwarded to the caller's contract.
    unsafe {
        core::arch::asm!(
            "mov ecx, 0xC0000080",
            "rdmsr",
            "or eax, (1 << 11)",
            "wrmsr",
            out("ecx") _, out("eax") _, out("edx") _,
            options(nomem, nostack),
        );

        core::arch::asm!(
            "mov {tmp}, cr4",
            "or {tmp}, (1 << 7)",
            "mov cr4, {tmp}",
            tmp = out(reg) _,
            options(nomem, nostack),
        );

        core::arch::asm!(
            "mov {tmp}, cr0",
            "or {tmp}, (1 << 16)",
            "mov cr0, {tmp}",
            tmp = out(reg) _,
            options(nomem, nostack),
        );

        core::arch::asm!(
            "mov ecx, 0x277",
            "rdmsr",
            "and edx, 0xFFFFFF00",
            "or  edx, 0x01",
            "wrmsr",
            out("ecx") _, out("eax") _, out("edx") _,
            options(nomem, nostack),
        );
    }
}

// ---------------------------------------------------------------------------
// Boot info construction
// ---------------------------------------------------------------------------

fn build_memory_map(
    memmap_response: &limine::MemMapResponse,
    alloc_region_start: u64,
    alloc_region_size: u64,
    frames_used: u64,
) -> ArrayVec<MemoryMapEntry, MAX_MEMORY_MAP_ENTRIES> {
    let consumed_bytes = frames_used * 0x1000;

    let mut entries = ArrayVec::new();
    for (i, entry) in memmap_response.entries().into_iter().enumerate() {
        let mut len = entry.length;
        if entry.type_ == limine::memmap::MemMapEntryType::Usable
            && entry.base == alloc_region_start
            && entry.length == alloc_region_size
        {
            len -= consumed_bytes;
        }

        entries.insert(
            i,
            MemoryMapEntry { base: PhysAddr::new(entry.base), len, kind: convert_memory_kind(entry.type_) },
        );
    }
    entries
}

fn convert_memory_kind(kind: limine::memmap::MemMapEntryType) -> MemoryKind {
    use limine::memmap::MemMapEntryType;
    match kind {
        MemMapEntryType::Usable => MemoryKind::Free,
        MemMapEntryType::AcpiReclaimable | MemMapEntryType::BootloaderReclaimable => MemoryKind::Reclaimable,
        MemMapEntryType::KernelAndModules | MemMapEntryType::Framebuffer => MemoryKind::InUse,
        _ => MemoryKind::ReservedOrUnusable,
    }
}

/// Builds the CPU descriptor list from the Limine MP response. The entry for
/// the bootstrap processor itself is included, matching
/// [`cascade_kernel::boot::BootInfo::cpus`]'s documented contract ("every
/// CPU the bootloader discovered, bootstrap CPU included"), with the
/// bootstrap entry first.
fn build_cpus() -> ArrayVec<CpuDescriptor, MAX_CPUS> {
    let mut cpus = ArrayVec::new();

    let Some(mp_response) = REQUESTS.mp.response() else {
        return cpus;
    };

    let bsp_lapic_id = mp_response.bsp_lapic_id;
    cascade_core::kdebug!(
        "MP response: bsp_lapic_id={}, cpu_count={}",
        bsp_lapic_id,
        mp_response.cpu_count
    );

    // Bootstrap entry first, with no goto/extra pointers — this CPU is
    // already running and is never released through `CpuDescriptor::boot`.
    for cpu_info in mp_response.cpus() {
        if cpu_info.lapic_id == bsp_lapic_id {
            cpus.insert(
                0,
                CpuDescriptor {
                    processor_id: cpu_info.processor_id,
                    goto_address_ptr: core::ptr::null_mut(),
                    extra_argument_ptr: core::ptr::null_mut(),
                },
            );
            break;
        }
    }

    for cpu_info in mp_response.cpus() {
        if cpus.len() >= MAX_CPUS {
            break;
        }
        if cpu_info.lapic_id == bsp_lapic_id {
            continue;
        }

        let info_ptr = cpu_info as *const limine::mp::MpInfo;
        // SAFETY: `MpInfo` is `#[repr(C)]`; `goto_address` sits at offset 16
        // (processor_id: u32 + lapic_id: u32 + _reserved: u64) and
        // `extra_argument` immediately after it.
        let goto_ptr = unsafe { (info_ptr as *mut u8).add(16) as *mut u64 };
        let extra_ptr = unsafe { (info_ptr as *mut u8).add(24) as *mut u64 };

        let index = cpus.len();
        cpus.insert(
            index,
            CpuDescriptor {
                processor_id: cpu_info.processor_id,
                goto_address_ptr: goto_ptr,
                extra_argument_ptr: extra_ptr,
            },
        );
    }

    cascade_core::kinfo!("MP: {} CPUs detected (BSP LAPIC ID={})", cpus.len(), bsp_lapic_id);
    cpus
}

fn log_boot_info(boot_info: &BootInfoData) {
    cascade_core::kinfo!("=== CascadeOS boot info ===");
    cascade_core::kdebug!("direct map offset: {:#x}", boot_info.direct_map_offset);
    cascade_core::ktrace!(
        "kernel phys base: {}, virt base: {:#x}",
        boot_info.kernel_physical_base,
        boot_info.kernel_virtual_base
    );
    cascade_core::kinfo!("memory map: {} regions", boot_info.memory_map.len());

    let mut usable_kib = 0u64;
    for entry in boot_info.memory_map.iter() {
        if entry.kind == MemoryKind::Free {
            usable_kib += entry.len / 1024;
        }
    }
    cascade_core::kinfo!("usable memory: {} MiB", usable_kib / 1024);
    cascade_core::kinfo!("CPUs discovered: {}", boot_info.cpus.len());
    if let Some(rsdp) = boot_info.rsdp_address {
        cascade_core::kdebug!("RSDP: {}", rsdp);
    }
    cascade_core::kinfo!("===========================");
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    cascade_core::kfatal!("{}", info);
    loop {
        core::hint::spin_loop();
    }
}
