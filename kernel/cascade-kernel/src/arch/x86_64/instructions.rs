//! Thin wrappers over the handful of x86_64 instructions
//! [`super::KernelArch`] needs: interrupt masking, halting, spin hints.

use core::arch::asm;

/// Disables interrupts on the calling CPU.
#[inline]
pub fn disable() {
    // SAFETY: `cli` has no memory effects and does not touch the stack.
    unsafe {
        asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables interrupts on the calling CPU.
///
/// # Safety
/// The caller must be ready for interrupt handlers to run immediately
/// after this returns.
#[inline]
pub unsafe fn enable() {
    // SAFETY: forwarded to the caller's contract.
    unsafe {
        asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Returns whether interrupts are currently enabled (RFLAGS.IF).
#[inline]
pub fn are_enabled() -> bool {
    let rflags: u64;
    // SAFETY: pushfq/pop touch only the stack and a scratch register.
    unsafe {
        asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags));
    }
    rflags & (1 << 9) != 0
}

/// Halts the CPU until the next interrupt.
///
/// # Safety
/// The caller must be prepared for this CPU to stop executing until an
/// interrupt (including an NMI) arrives.
#[inline]
pub unsafe fn hlt() {
    // SAFETY: forwarded to the caller's contract.
    unsafe {
        asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

/// Enables interrupts and halts as a single atomic step, closing the
/// window where an interrupt could be missed between `sti` and `hlt`.
///
/// # Safety
/// Same as [`enable`].
#[inline]
pub unsafe fn enable_and_hlt() {
    // SAFETY: forwarded to the caller's contract.
    unsafe {
        asm!("sti", "hlt", options(nomem, nostack, preserves_flags));
    }
}

/// Hints to the CPU that this is a spin-wait loop.
#[inline]
pub fn pause() {
    // SAFETY: `pause` is a no-op hint with no side effects.
    unsafe {
        asm!("pause", options(nomem, nostack, preserves_flags));
    }
}
