//! Host glue for an embedded ACPI/AML interpreter.
//!
//! No AML interpreter is vendored here (parsing and executing ACPI's
//! bytecode is out of scope for this substrate) — this module only builds
//! the narrow callback surface such an interpreter needs from its host:
//! mapping physical memory, PCI/port I/O, mutexes and spinlocks built on
//! the kernel's own primitives, interrupt vector installation, and a
//! monotonic clock. A concrete interpreter would be handed a
//! `*mut c_void` context pointer plus this table of `extern "C" fn`s.
//!
//! [`PlatformOps`] is the seam: the real implementation (port I/O,
//! MMIO PCI config space, IOAPIC vector routing) lives behind
//! `target_os = "none"` in [`crate::arch`]; this module is tested against
//! a fake host harness instead.

use core::ffi::c_void;

use cascade_core::addr::{PhysAddr, VirtAddr};

/// Platform operations an ACPI host-glue layer needs from the kernel.
///
/// A `'static` implementor is installed once (normally a zero-sized type
/// whose methods reach into kernel statics) and reached through the
/// `context` pointer every `extern "C" fn` callback receives.
pub trait PlatformOps {
    /// Maps `len` bytes of physical memory starting at `phys` and returns
    /// the mapped virtual address. Implementations may simply return the
    /// non-cached direct-map address, since ACPI tables and MMIO regions
    /// referenced during AML execution are always direct-mappable.
    fn map(&self, phys: PhysAddr, len: u64) -> VirtAddr;
    /// Reverses [`PlatformOps::map`]. A no-op for a direct-map-backed
    /// implementation.
    fn unmap(&self, virt: VirtAddr, len: u64);

    /// Reads `width` bytes (1, 2, or 4) from PCI config space at
    /// `(bus, device, function, offset)`.
    fn pci_read(&self, bus: u8, device: u8, function: u8, offset: u16, width: u8) -> u32;
    /// Writes `width` bytes (1, 2, or 4) to PCI config space.
    fn pci_write(&self, bus: u8, device: u8, function: u8, offset: u16, width: u8, value: u32);

    /// Reads `width` bytes (1, 2, or 4) from I/O port `port`.
    fn io_read(&self, port: u16, width: u8) -> u32;
    /// Writes `width` bytes (1, 2, or 4) to I/O port `port`.
    fn io_write(&self, port: u16, width: u8, value: u32);

    /// Creates a mutex suitable for AML's interrupts-enabled `Mutex`
    /// operand, returning an opaque handle.
    fn create_mutex(&self) -> u64;
    /// Acquires a mutex created by [`PlatformOps::create_mutex`]. Returns
    /// `false` on timeout.
    fn acquire_mutex(&self, handle: u64, timeout_ms: u16) -> bool;
    /// Releases a mutex acquired by [`PlatformOps::acquire_mutex`].
    fn release_mutex(&self, handle: u64);

    /// Creates a spinlock for AML contexts that run with interrupts
    /// disabled, returning an opaque handle.
    fn create_spinlock(&self) -> u64;
    /// Acquires a spinlock created by [`PlatformOps::create_spinlock`].
    fn lock_spinlock(&self, handle: u64);
    /// Releases a spinlock acquired by [`PlatformOps::lock_spinlock`].
    fn unlock_spinlock(&self, handle: u64);

    /// Installs an interrupt handler for ACPI's SCI (or a GPE), returning
    /// the allocated vector number.
    fn install_interrupt_handler(&self, gsi: u32, handler: extern "C" fn(*mut c_void), context: *mut c_void) -> u32;

    /// Nanoseconds elapsed since boot, from the kernel's monotonic clock.
    fn get_nanoseconds_since_boot(&self) -> u64;
}

/// Casts `context` back to `&'a P`.
///
/// # Safety
/// `context` must have been produced from `&P as *const P as *mut c_void`
/// for a `P` that outlives the call.
unsafe fn ops<'a, P: PlatformOps>(context: *mut c_void) -> &'a P {
    // SAFETY: forwarded to the caller's contract.
    unsafe { &*(context.cast::<P>()) }
}

/// `map` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
pub unsafe extern "C" fn map<P: PlatformOps>(context: *mut c_void, phys: u64, len: u64) -> *mut c_void {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.map(PhysAddr::new(phys), len).as_mut_ptr::<c_void>()
}

/// `unmap` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
pub unsafe extern "C" fn unmap<P: PlatformOps>(context: *mut c_void, virt: *mut c_void, len: u64) {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.unmap(VirtAddr::new_truncate(virt as u64), len);
}

/// `pci_read` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
pub unsafe extern "C" fn pci_read<P: PlatformOps>(
    context: *mut c_void,
    bus: u8,
    device: u8,
    function: u8,
    offset: u16,
    width: u8,
) -> u32 {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.pci_read(bus, device, function, offset, width)
}

/// `pci_write` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn pci_write<P: PlatformOps>(
    context: *mut c_void,
    bus: u8,
    device: u8,
    function: u8,
    offset: u16,
    width: u8,
    value: u32,
) {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.pci_write(bus, device, function, offset, width, value);
}

/// `io_read` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
pub unsafe extern "C" fn io_read<P: PlatformOps>(context: *mut c_void, port: u16, width: u8) -> u32 {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.io_read(port, width)
}

/// `io_write` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
pub unsafe extern "C" fn io_write<P: PlatformOps>(context: *mut c_void, port: u16, width: u8, value: u32) {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.io_write(port, width, value);
}

/// `create_mutex` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
pub unsafe extern "C" fn create_mutex<P: PlatformOps>(context: *mut c_void) -> u64 {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.create_mutex()
}

/// `acquire_mutex` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
pub unsafe extern "C" fn acquire_mutex<P: PlatformOps>(context: *mut c_void, handle: u64, timeout_ms: u16) -> bool {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.acquire_mutex(handle, timeout_ms)
}

/// `release_mutex` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
pub unsafe extern "C" fn release_mutex<P: PlatformOps>(context: *mut c_void, handle: u64) {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.release_mutex(handle);
}

/// `get_nanoseconds_since_boot` callback.
///
/// # Safety
/// `context` must be a valid `&P` as established by [`ops`].
pub unsafe extern "C" fn get_nanoseconds_since_boot<P: PlatformOps>(context: *mut c_void) -> u64 {
    // SAFETY: forwarded to the caller's contract.
    let platform = unsafe { ops::<P>(context) };
    platform.get_nanoseconds_since_boot()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHostPlatform {
        config_space: Mutex<HashMap<(u8, u8, u8, u16), u32>>,
        ports: Mutex<HashMap<u16, u32>>,
        clock_ns: Cell<u64>,
        next_handle: Cell<u64>,
    }

    // SAFETY: test-only single-threaded harness; `Cell` access never
    // overlaps across threads in these tests.
    unsafe impl Sync for FakeHostPlatform {}

    impl PlatformOps for FakeHostPlatform {
        fn map(&self, phys: PhysAddr, _len: u64) -> VirtAddr {
            VirtAddr::new_truncate(phys.as_u64() | 0xffff_8000_0000_0000)
        }
        fn unmap(&self, _virt: VirtAddr, _len: u64) {}
        fn pci_read(&self, bus: u8, device: u8, function: u8, offset: u16, _width: u8) -> u32 {
            *self.config_space.lock().unwrap().get(&(bus, device, function, offset)).unwrap_or(&0)
        }
        fn pci_write(&self, bus: u8, device: u8, function: u8, offset: u16, _width: u8, value: u32) {
            self.config_space.lock().unwrap().insert((bus, device, function, offset), value);
        }
        fn io_read(&self, port: u16, _width: u8) -> u32 {
            *self.ports.lock().unwrap().get(&port).unwrap_or(&0)
        }
        fn io_write(&self, port: u16, _width: u8, value: u32) {
            self.ports.lock().unwrap().insert(port, value);
        }
        fn create_mutex(&self) -> u64 {
            let h = self.next_handle.get();
            self.next_handle.set(h + 1);
            h
        }
        fn acquire_mutex(&self, _handle: u64, _timeout_ms: u16) -> bool {
            true
        }
        fn release_mutex(&self, _handle: u64) {}
        fn create_spinlock(&self) -> u64 {
            self.create_mutex()
        }
        fn lock_spinlock(&self, _handle: u64) {}
        fn unlock_spinlock(&self, _handle: u64) {}
        fn install_interrupt_handler(
            &self,
            gsi: u32,
            _handler: extern "C" fn(*mut c_void),
            _context: *mut c_void,
        ) -> u32 {
            32 + gsi
        }
        fn get_nanoseconds_since_boot(&self) -> u64 {
            self.clock_ns.get()
        }
    }

    fn context_of(platform: &FakeHostPlatform) -> *mut c_void {
        (platform as *const FakeHostPlatform).cast_mut().cast::<c_void>()
    }

    #[test]
    fn map_returns_direct_mapped_address() {
        let platform = FakeHostPlatform::default();
        let ctx = context_of(&platform);
        // SAFETY: `ctx` was just constructed from `&platform`.
        let virt = unsafe { map::<FakeHostPlatform>(ctx, 0x1000, 0x1000) };
        assert_eq!(virt as u64, 0xffff_8000_0000_1000);
    }

    #[test]
    fn pci_read_write_roundtrip() {
        let platform = FakeHostPlatform::default();
        let ctx = context_of(&platform);
        // SAFETY: `ctx` was just constructed from `&platform`.
        unsafe {
            pci_write::<FakeHostPlatform>(ctx, 0, 2, 0, 0x10, 4, 0xdead_beef);
            assert_eq!(pci_read::<FakeHostPlatform>(ctx, 0, 2, 0, 0x10, 4), 0xdead_beef);
            assert_eq!(pci_read::<FakeHostPlatform>(ctx, 1, 2, 0, 0x10, 4), 0);
        }
    }

    #[test]
    fn io_read_write_roundtrip() {
        let platform = FakeHostPlatform::default();
        let ctx = context_of(&platform);
        // SAFETY: `ctx` was just constructed from `&platform`.
        unsafe {
            io_write::<FakeHostPlatform>(ctx, 0x60, 1, 0xaa);
            assert_eq!(io_read::<FakeHostPlatform>(ctx, 0x60, 1), 0xaa);
        }
    }

    #[test]
    fn mutex_handles_are_distinct() {
        let platform = FakeHostPlatform::default();
        let ctx = context_of(&platform);
        // SAFETY: `ctx` was just constructed from `&platform`.
        unsafe {
            let a = create_mutex::<FakeHostPlatform>(ctx);
            let b = create_mutex::<FakeHostPlatform>(ctx);
            assert_ne!(a, b);
            assert!(acquire_mutex::<FakeHostPlatform>(ctx, a, 100));
            release_mutex::<FakeHostPlatform>(ctx, a);
        }
    }

    #[test]
    fn interrupt_handler_installs_a_vector_above_32() {
        let platform = FakeHostPlatform::default();
        let ctx = context_of(&platform);
        extern "C" fn handler(_: *mut c_void) {}
        let vector = platform.install_interrupt_handler(9, handler, ctx);
        assert_eq!(vector, 41);
    }
}
