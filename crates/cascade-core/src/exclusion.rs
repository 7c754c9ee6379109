//! CPU preemption/interrupt exclusion tokens.
//!
//! Separating preemption exclusion from interrupt exclusion lets high-level
//! mutexes disable only preemption (cheap, still interruptible), while
//! spinlocks visible to interrupt context disable both.
//!
//! Tokens are short-lived, bound to the CPU that produced them, and
//! single-use: releasing is done by dropping (or calling
//! [`PreemptionExclusion::release`] / [`InterruptExclusion::release`]
//! explicitly). They deliberately do not implement `Clone` or `Copy` — an
//! exclusion obligation must not be duplicated.

use crate::arch::{Arch, Cpu};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

/// Per-CPU exclusion counters, embedded in a concrete architecture's
/// per-CPU state.
///
/// Nonnegative; acquiring increments (0→1 disables the relevant masking),
/// releasing decrements (1→0 re-enables it).
#[derive(Debug, Default)]
pub struct ExclusionCounters {
    preempt_depth: AtomicU32,
    interrupt_depth: AtomicU32,
}

impl ExclusionCounters {
    /// Creates a fresh, zeroed set of counters.
    pub const fn new() -> Self {
        Self {
            preempt_depth: AtomicU32::new(0),
            interrupt_depth: AtomicU32::new(0),
        }
    }
}

/// A CPU whose per-CPU state includes [`ExclusionCounters`].
pub trait ExclusionCpu: Cpu {
    /// Returns this CPU's exclusion counters.
    fn exclusion_counters(&self) -> &ExclusionCounters;
}

/// A token representing preemption disabled on the CPU that produced it.
///
/// Dropping (or calling [`release`](Self::release)) decrements the
/// producing CPU's preemption-disable counter.
#[must_use = "dropping this token immediately releases the exclusion"]
pub struct PreemptionExclusion<C: 'static> {
    cpu: &'static C,
}

/// A token representing interrupts disabled on the CPU that produced it.
///
/// Carries the concrete `A: Arch` that acquired it, so [`Drop`] can call
/// back into `A::enable_interrupts()` when the last token for this CPU is
/// released — the exclusion counters alone don't remember which
/// architecture disabled interrupts in the first place.
#[must_use = "dropping this token immediately releases the exclusion"]
pub struct InterruptExclusion<C: 'static, A: 'static> {
    cpu: &'static C,
    _arch: PhantomData<fn() -> A>,
}

/// The product of [`PreemptionExclusion`] and [`InterruptExclusion`];
/// releasing restores both, interrupt exclusion first.
#[must_use = "dropping this token immediately releases the exclusion"]
pub struct PreemptionInterruptExclusion<C: 'static, A: 'static> {
    preempt: PreemptionExclusion<C>,
    interrupt: InterruptExclusion<C, A>,
}

impl<C: ExclusionCpu> PreemptionExclusion<C> {
    /// Acquires preemption exclusion on the current CPU via `A`.
    ///
    /// # Safety
    ///
    /// Follows [`Arch::current_cpu`]'s contract: the caller must not be
    /// holding any other live `&mut Cpu` borrow across this call.
    pub unsafe fn acquire<A: Arch<Cpu = C>>() -> Self {
        // SAFETY: forwarded to `Arch::current_cpu`'s caller contract.
        let cpu = unsafe { A::current_cpu() };
        let counters = cpu.exclusion_counters();
        counters.preempt_depth.fetch_add(1, Ordering::AcqRel);
        Self { cpu }
    }

    /// Releases the exclusion. Equivalent to dropping the token.
    pub fn release(self) {
        drop(self);
    }
}

impl<C: ExclusionCpu> Drop for PreemptionExclusion<C> {
    fn drop(&mut self) {
        let counters = self.cpu.exclusion_counters();
        let prev = counters.preempt_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "preemption exclusion released while not held");
    }
}

impl<C: ExclusionCpu, A: Arch<Cpu = C>> InterruptExclusion<C, A> {
    /// Disables interrupts and acquires interrupt exclusion on the current
    /// CPU via `A`.
    ///
    /// # Safety
    ///
    /// Same contract as [`PreemptionExclusion::acquire`].
    pub unsafe fn acquire() -> Self {
        A::disable_interrupts();
        // SAFETY: interrupts are now disabled, so `current_cpu` cannot be
        // concurrently accessed from an interrupt handler on this CPU.
        let cpu = unsafe { A::current_cpu() };
        let counters = cpu.exclusion_counters();
        counters.interrupt_depth.fetch_add(1, Ordering::AcqRel);
        Self { cpu, _arch: PhantomData }
    }

    /// Releases the exclusion. Equivalent to dropping the token.
    pub fn release(self) {
        drop(self);
    }
}

impl<C: ExclusionCpu, A: Arch<Cpu = C>> Drop for InterruptExclusion<C, A> {
    fn drop(&mut self) {
        let counters = self.cpu.exclusion_counters();
        let prev = counters.interrupt_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "interrupt exclusion released while not held");
        if prev == 1 {
            A::enable_interrupts();
        }
    }
}

impl<C: ExclusionCpu, A: Arch<Cpu = C>> PreemptionInterruptExclusion<C, A> {
    /// Acquires both preemption and interrupt exclusion on the current CPU.
    ///
    /// # Safety
    ///
    /// Same contract as [`PreemptionExclusion::acquire`].
    pub unsafe fn acquire() -> Self {
        // Interrupt exclusion first (it also disables interrupts), then
        // preemption — releasing happens in reverse order via field drop
        // order (interrupt dropped last since preempt is declared first).
        // SAFETY: forwarded to the callee's contract.
        let interrupt = unsafe { InterruptExclusion::<C, A>::acquire() };
        // SAFETY: interrupts are already disabled by the line above.
        let preempt = unsafe { PreemptionExclusion::acquire::<A>() };
        Self { preempt, interrupt }
    }

    /// Returns the id of the CPU that acquired this token.
    ///
    /// Reads off the reference the token already holds rather than calling
    /// [`Arch::current_cpu`] again, since a second call while this token is
    /// live would violate `current_cpu`'s no-aliasing contract.
    pub fn cpu_id(&self) -> crate::id::CpuId {
        self.preempt.cpu.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{PhysAddr, PhysicalRange, VirtualRange};
    use crate::arch::{Arch, MapError, MapType, PageTable};
    use crate::id::CpuId;
    use std::sync::atomic::AtomicBool;

    struct TestCpu {
        counters: ExclusionCounters,
    }

    impl Cpu for TestCpu {
        fn id(&self) -> CpuId {
            CpuId::new(0)
        }
    }

    impl ExclusionCpu for TestCpu {
        fn exclusion_counters(&self) -> &ExclusionCounters {
            &self.counters
        }
    }

    struct TestPageTable;
    impl PageTable for TestPageTable {}

    static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

    static CPU: TestCpu = TestCpu {
        counters: ExclusionCounters::new(),
    };

    // `CPU` above is shared process-wide static state; serialize the tests
    // in this module so they don't observe each other's counters.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    struct TestArch;

    impl Arch for TestArch {
        type Cpu = TestCpu;
        type PageTable = TestPageTable;

        fn disable_interrupts() {
            INTERRUPTS_ENABLED.store(false, Ordering::Release);
        }

        fn enable_interrupts() {
            INTERRUPTS_ENABLED.store(true, Ordering::Release);
        }

        fn interrupts_enabled() -> bool {
            INTERRUPTS_ENABLED.load(Ordering::Acquire)
        }

        fn disable_and_halt() -> ! {
            panic!("halt called in test");
        }

        unsafe fn current_cpu() -> &'static mut Self::Cpu {
            #[allow(invalid_reference_casting)]
            // SAFETY: test is single-threaded with respect to this static.
            unsafe {
                &mut *(&CPU as *const TestCpu as *mut TestCpu)
            }
        }

        fn spin_loop_hint() {}

        unsafe fn map_range(
            _page_table: &mut Self::PageTable,
            _virtual_range: VirtualRange,
            _physical_range: PhysicalRange,
            _map_type: MapType,
        ) -> Result<(), MapError> {
            Ok(())
        }

        unsafe fn unmap_range(
            _page_table: &mut Self::PageTable,
            _virtual_range: VirtualRange,
            _on_unmapped: &mut dyn FnMut(PhysAddr),
        ) -> Result<(), MapError> {
            Ok(())
        }
    }

    #[test]
    fn preemption_exclusion_increments_and_releases() {
        let _guard = TEST_LOCK.lock().unwrap();
        assert_eq!(CPU.counters.preempt_depth.load(Ordering::Relaxed), 0);
        // SAFETY: single-threaded test.
        let token = unsafe { PreemptionExclusion::acquire::<TestArch>() };
        assert_eq!(CPU.counters.preempt_depth.load(Ordering::Relaxed), 1);
        token.release();
        assert_eq!(CPU.counters.preempt_depth.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn interrupt_exclusion_disables_interrupts() {
        let _guard = TEST_LOCK.lock().unwrap();
        TestArch::enable_interrupts();
        // SAFETY: single-threaded test.
        let token = unsafe { InterruptExclusion::<TestCpu, TestArch>::acquire() };
        assert!(!TestArch::interrupts_enabled());
        drop(token);
        assert!(TestArch::interrupts_enabled());
    }

    #[test]
    fn nested_interrupt_exclusion_reenables_only_on_outermost_release() {
        let _guard = TEST_LOCK.lock().unwrap();
        TestArch::enable_interrupts();
        // SAFETY: single-threaded test.
        let outer = unsafe { InterruptExclusion::<TestCpu, TestArch>::acquire() };
        // SAFETY: same.
        let inner = unsafe { InterruptExclusion::<TestCpu, TestArch>::acquire() };
        assert!(!TestArch::interrupts_enabled());
        drop(inner);
        assert!(
            !TestArch::interrupts_enabled(),
            "interrupts must stay disabled while the outer token is still live"
        );
        drop(outer);
        assert!(TestArch::interrupts_enabled());
    }

    #[test]
    fn combined_exclusion_increments_both() {
        let _guard = TEST_LOCK.lock().unwrap();
        TestArch::enable_interrupts();
        // SAFETY: single-threaded test.
        let token = unsafe { PreemptionInterruptExclusion::<TestCpu, TestArch>::acquire() };
        assert_eq!(CPU.counters.preempt_depth.load(Ordering::Relaxed), 1);
        assert_eq!(CPU.counters.interrupt_depth.load(Ordering::Relaxed), 1);
        assert!(!TestArch::interrupts_enabled());
        drop(token);
        assert_eq!(CPU.counters.preempt_depth.load(Ordering::Relaxed), 0);
        assert_eq!(CPU.counters.interrupt_depth.load(Ordering::Relaxed), 0);
        assert!(TestArch::interrupts_enabled());
    }
}
