//! A FIFO-fair ticket spin lock.
//!
//! Acquirers draw a ticket from a monotonically increasing counter and spin
//! until `now_serving` reaches their number — unlike a test-and-test-and-set
//! spinlock, this guarantees first-come-first-served ordering with no
//! starvation under contention, at the cost of one extra atomic increment
//! per acquire.
//!
//! Every acquire also takes a [`PreemptionInterruptExclusion`] token for the
//! calling CPU, so a lock held by a normal-context acquirer can never be
//! re-entered by an interrupt handler on the same CPU.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::Arch;
use crate::exclusion::{ExclusionCpu, PreemptionInterruptExclusion};
use crate::id::CpuId;

/// A FIFO-fair spin lock protecting `T`.
///
/// Const-constructable so it can be placed in `static` items.
pub struct TicketLock<T> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    /// The CPU currently holding the lock, or [`CpuId::NONE`] while free.
    holder: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the ticket protocol gives exclusive access to `T` to exactly one
// holder at a time; `T: Send` is required since the holder may be a
// different CPU than the one that created the lock.
unsafe impl<T: Send> Send for TicketLock<T> {}
unsafe impl<T: Send> Sync for TicketLock<T> {}

impl<T> TicketLock<T> {
    /// Creates a new unlocked `TicketLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            holder: AtomicU32::new(CpuId::NONE.as_u32()),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling preemption and interrupts on the
    /// calling CPU for the duration of the hold.
    ///
    /// # Safety
    ///
    /// Same contract as [`PreemptionInterruptExclusion::acquire`]: the
    /// caller must not already hold a live `&mut Cpu` borrow for the
    /// current CPU.
    pub unsafe fn lock<A: Arch>(&self) -> TicketLockGuard<'_, T, A>
    where
        A::Cpu: ExclusionCpu,
    {
        // SAFETY: forwarded to the caller's contract.
        let exclusion = unsafe { PreemptionInterruptExclusion::<A::Cpu, A>::acquire() };
        let cpu_id = exclusion.cpu_id();
        debug_assert!(
            self.holder.load(Ordering::Acquire) != cpu_id.as_u32(),
            "recursive acquisition of TicketLock by the same CPU"
        );
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            A::spin_loop_hint();
        }
        self.holder.store(cpu_id.as_u32(), Ordering::Release);
        TicketLockGuard {
            lock: self,
            _exclusion: exclusion,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Succeeds only if this call's ticket would immediately be served,
    /// i.e. the lock is uncontended. Acquires the same exclusion as
    /// [`TicketLock::lock`] on success.
    ///
    /// # Safety
    ///
    /// Same contract as [`TicketLock::lock`].
    pub unsafe fn try_lock<A: Arch>(&self) -> Option<TicketLockGuard<'_, T, A>>
    where
        A::Cpu: ExclusionCpu,
    {
        // SAFETY: forwarded to the caller's contract.
        let exclusion = unsafe { PreemptionInterruptExclusion::<A::Cpu, A>::acquire() };
        let cpu_id = exclusion.cpu_id();
        let now_serving = self.now_serving.load(Ordering::Acquire);
        match self.next_ticket.compare_exchange(
            now_serving,
            now_serving + 1,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                self.holder.store(cpu_id.as_u32(), Ordering::Release);
                Some(TicketLockGuard {
                    lock: self,
                    _exclusion: exclusion,
                    _not_send: PhantomData,
                })
            }
            Err(_) => None,
        }
    }

    /// Returns whether `cpu` currently holds this lock.
    pub fn is_locked_by(&self, cpu: CpuId) -> bool {
        self.holder.load(Ordering::Acquire) == cpu.as_u32()
    }

    /// Returns a mutable reference to the underlying data without acquiring
    /// the lock.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other code is concurrently accessing the
    /// data. Intended as a last resort (e.g. a panic handler dumping state).
    pub unsafe fn force_get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Forcibly releases the lock without going through a
    /// [`TicketLockGuard`]'s `Drop`.
    ///
    /// # Safety
    ///
    /// The caller must ensure no live `TicketLockGuard` for this lock
    /// exists afterward (e.g. recovery after a panic that unwound past a
    /// held guard without running its destructor). Calling this while a
    /// guard is still live grants two holders access at once.
    pub unsafe fn unsafe_release(&self) {
        self.holder.store(CpuId::NONE.as_u32(), Ordering::Release);
        self.now_serving.fetch_add(1, Ordering::Release);
    }
}

/// RAII guard returned by [`TicketLock::lock`]/[`TicketLock::try_lock`].
///
/// Releasing advances `now_serving`, letting the next queued ticket proceed,
/// then drops the exclusion token, restoring preemption/interrupt state.
/// Not `Send`: the exclusion it holds is tied to the CPU that acquired it.
pub struct TicketLockGuard<'a, T, A: Arch>
where
    A::Cpu: ExclusionCpu,
{
    lock: &'a TicketLock<T>,
    _exclusion: PreemptionInterruptExclusion<A::Cpu, A>,
    _not_send: PhantomData<*const ()>,
}

impl<T, A: Arch> Deref for TicketLockGuard<'_, T, A>
where
    A::Cpu: ExclusionCpu,
{
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard proves this ticket is being served.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, A: Arch> DerefMut for TicketLockGuard<'_, T, A>
where
    A::Cpu: ExclusionCpu,
{
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard proves this ticket is being served.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, A: Arch> Drop for TicketLockGuard<'_, T, A>
where
    A::Cpu: ExclusionCpu,
{
    fn drop(&mut self) {
        debug_assert_eq!(
            self.lock.holder.load(Ordering::Acquire),
            self._exclusion.cpu_id().as_u32(),
            "TicketLockGuard released by a CPU other than its holder"
        );
        self.lock.holder.store(CpuId::NONE.as_u32(), Ordering::Release);
        self.lock.now_serving.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{PhysAddr, PhysicalRange, VirtualRange};
    use crate::arch::{Arch, Cpu, MapError, MapType, PageTable};
    use crate::exclusion::ExclusionCounters;
    use crate::id::CpuId;
    use std::sync::Arc;
    use std::thread;

    struct TestCpu {
        id: u32,
        counters: ExclusionCounters,
    }

    impl Cpu for TestCpu {
        fn id(&self) -> CpuId {
            CpuId::new(self.id)
        }
    }

    impl ExclusionCpu for TestCpu {
        fn exclusion_counters(&self) -> &ExclusionCounters {
            &self.counters
        }
    }

    struct TestPageTable;
    impl PageTable for TestPageTable {}

    static NEXT_CPU_ID: AtomicU32 = AtomicU32::new(0);

    thread_local! {
        // Each OS thread stands in for a distinct logical CPU, so each gets
        // its own id — sharing one would make the reentrance check in
        // `TicketLock::lock` mistake independent threads for the same CPU.
        static CPU: TestCpu = TestCpu {
            id: NEXT_CPU_ID.fetch_add(1, Ordering::Relaxed),
            counters: ExclusionCounters::new(),
        };
    }

    struct TestArch;

    impl Arch for TestArch {
        type Cpu = TestCpu;
        type PageTable = TestPageTable;

        fn disable_interrupts() {}
        fn enable_interrupts() {}
        fn interrupts_enabled() -> bool {
            true
        }
        fn disable_and_halt() -> ! {
            panic!("halt called in test");
        }

        unsafe fn current_cpu() -> &'static mut Self::Cpu {
            CPU.with(|cpu| {
                let ptr = cpu as *const TestCpu as *mut TestCpu;
                // SAFETY: each test thread has its own thread-local `CPU`,
                // so distinct threads never alias this pointer.
                unsafe { &mut *ptr }
            })
        }

        fn spin_loop_hint() {
            core::hint::spin_loop();
        }

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
    fn lock_unlock_roundtrip() {
        let lock = TicketLock::new(42);
        // SAFETY: single-threaded test, no aliasing `current_cpu` borrow.
        let guard = unsafe { lock.lock::<TestArch>() };
        assert_eq!(*guard, 42);
        drop(guard);
        // SAFETY: same as above.
        let guard = unsafe { lock.try_lock::<TestArch>() };
        assert!(guard.is_some());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = TicketLock::new(0);
        // SAFETY: single-threaded test.
        let _guard = unsafe { lock.lock::<TestArch>() };
        // SAFETY: same.
        assert!(unsafe { lock.try_lock::<TestArch>() }.is_none());
    }

    #[test]
    fn mutation_through_guard() {
        let lock = TicketLock::new(0);
        {
            // SAFETY: single-threaded test.
            let mut guard = unsafe { lock.lock::<TestArch>() };
            *guard = 99;
        }
        // SAFETY: same.
        let guard = unsafe { lock.lock::<TestArch>() };
        assert_eq!(*guard, 99);
    }

    #[test]
    fn is_locked_by_tracks_the_holder() {
        let lock = TicketLock::new(0);
        let this_cpu = CPU.with(|cpu| cpu.id());
        assert!(!lock.is_locked_by(this_cpu));
        // SAFETY: single-threaded test.
        let guard = unsafe { lock.lock::<TestArch>() };
        assert!(lock.is_locked_by(this_cpu));
        drop(guard);
        assert!(!lock.is_locked_by(this_cpu));
    }

    #[test]
    #[should_panic(expected = "recursive acquisition")]
    fn same_cpu_relock_panics() {
        let lock = TicketLock::new(0);
        // SAFETY: single-threaded test.
        let _outer = unsafe { lock.lock::<TestArch>() };
        // SAFETY: same; intentionally re-entering to exercise the assert.
        let _inner = unsafe { lock.lock::<TestArch>() };
    }

    #[test]
    fn unsafe_release_clears_holder_and_advances_serving() {
        let lock = TicketLock::new(0);
        let this_cpu = CPU.with(|cpu| cpu.id());
        // SAFETY: single-threaded test.
        let guard = unsafe { lock.lock::<TestArch>() };
        assert!(lock.is_locked_by(this_cpu));
        core::mem::forget(guard);
        // SAFETY: standing in for panic recovery; no live guard remains
        // since the one above was forgotten rather than dropped normally.
        unsafe { lock.unsafe_release() };
        assert!(!lock.is_locked_by(this_cpu));
        // SAFETY: same as other single-threaded acquisitions above.
        assert!(unsafe { lock.try_lock::<TestArch>() }.is_some());
    }

    #[test]
    fn concurrent_increments_are_serialized() {
        let lock = Arc::new(TicketLock::new(0u64));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        // SAFETY: each OS thread uses its own thread-local
                        // `TestCpu`, standing in for per-CPU state.
                        let mut guard = unsafe { lock.lock::<TestArch>() };
                        *guard += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        // SAFETY: all worker threads have joined.
        let guard = unsafe { lock.lock::<TestArch>() };
        assert_eq!(*guard, 8000);
    }
}
