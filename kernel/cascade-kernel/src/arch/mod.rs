//! Architecture selection and the facade every arch-specific module
//! implements uniformly.
//!
//! Exactly one of `x86_64`/`aarch64`/`riscv64` compiles for any given
//! kernel target, selected by `target_arch`. Each exposes a concrete
//! `KernelArch` implementing [`cascade_core::arch::Arch`] plus
//! `verify_boot_state`, the register-level assertions the boot handoff
//! (Limine-compatible: paging enabled, long mode active, PAT configured)
//! requires before anything else runs.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "riscv64")]
pub mod riscv64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{
    active_pml4_phys as active_kernel_page_table_phys, init_kernel_page_table, KernelArch,
    KernelPageTable, KERNEL_PAGE_TABLE, PMM,
};
#[cfg(target_arch = "aarch64")]
pub use aarch64::{
    active_l0_phys as active_kernel_page_table_phys, init_kernel_page_table, KernelArch,
    KernelPageTable, KERNEL_PAGE_TABLE, PMM,
};
#[cfg(target_arch = "riscv64")]
pub use riscv64::{
    active_root_phys as active_kernel_page_table_phys, init_kernel_page_table, KernelArch,
    KernelPageTable, KERNEL_PAGE_TABLE, PMM,
};

/// Errors [`verify_boot_state`] implementations can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchError {
    /// Paging was not enabled by the bootloader.
    PagingDisabled,
    /// The CPU is not running in the architecture's 64-bit mode (long mode
    /// on x86_64).
    Not64Bit,
    /// A required MMU feature (PAE, write-protect enforcement) is off.
    RequiredFeatureDisabled,
}

impl core::fmt::Display for ArchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PagingDisabled => write!(f, "paging is not enabled"),
            Self::Not64Bit => write!(f, "CPU is not in 64-bit mode"),
            Self::RequiredFeatureDisabled => write!(f, "a required MMU feature is disabled"),
        }
    }
}

/// Checks the register state the boot handoff promises (paging, long
/// mode/EL, required MMU features) before stage 1 proceeds any further.
///
/// # Safety
/// Must be called with interrupts disabled, before any other code reads
/// the same control registers.
pub unsafe fn verify_boot_state() -> Result<(), ArchError> {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: forwarded to the caller's contract.
    unsafe {
        x86_64::verify_boot_state()
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: forwarded to the caller's contract.
    unsafe {
        aarch64::verify_boot_state()
    }
    #[cfg(target_arch = "riscv64")]
    // SAFETY: forwarded to the caller's contract.
    unsafe {
        riscv64::verify_boot_state()
    }
}
