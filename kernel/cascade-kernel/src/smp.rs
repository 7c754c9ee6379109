//! SMP bootstrap sequencing: the named stages every executor passes
//! through during boot, and the atomic-counter rendezvous that brings the
//! bootstrap executor and every peer back together before the kernel
//! proper starts running tasks.
//!
//! The rendezvous itself follows the teacher's two-phase park/release
//! bootstrap (`arch::x86_64::smp::{park_aps, boot_aps}`): a timeout-bounded
//! spin-wait on a shared atomic counter, `kwarn!` if the timeout expires
//! rather than hanging forever. Unlike the teacher's ad hoc atomics, the
//! stages passed through on the way there are named enums, so a stuck boot
//! reports exactly which stage it never left.

use core::sync::atomic::{AtomicU32, Ordering};

use cascade_core::kwarn;

/// Stages the bootstrap executor (the first CPU to run, conventionally
/// CPU 0) passes through in order during boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapStage {
    /// Nothing has run yet; the arch entry point just transferred control.
    Init0,
    /// Early output (serial) is usable.
    EarlyOutput,
    /// The direct-map offset and kernel load addresses are known.
    OffsetsDetermined,
    /// Interrupt vectors/descriptor tables are installed (still disabled).
    InterruptsCaptured,
    /// The physical page allocator has a free list.
    PmmInitialized,
    /// The kernel's own page table is built and active.
    CorePageTableLoaded,
    /// ACPI tables are parsed and the host-glue callbacks are live.
    AcpiReady,
    /// A monotonic time source is available.
    TimeInitialized,
    /// The kernel heap can service allocations.
    HeapInitialized,
    /// Per-CPU stacks for every discovered CPU are allocated.
    StacksInitialized,
    /// Executor state for every discovered CPU is constructed.
    ExecutorsConstructed,
    /// Every peer CPU has been released from its park loop.
    PeersStarted,
    /// Every peer has reached the rendezvous barrier; boot is complete.
    BarrierCompleted,
}

impl BootstrapStage {
    const ORDER: &'static [BootstrapStage] = &[
        Self::Init0,
        Self::EarlyOutput,
        Self::OffsetsDetermined,
        Self::InterruptsCaptured,
        Self::PmmInitialized,
        Self::CorePageTableLoaded,
        Self::AcpiReady,
        Self::TimeInitialized,
        Self::HeapInitialized,
        Self::StacksInitialized,
        Self::ExecutorsConstructed,
        Self::PeersStarted,
        Self::BarrierCompleted,
    ];

    fn index(self) -> usize {
        Self::ORDER.iter().position(|s| *s == self).expect("BootstrapStage::ORDER is exhaustive")
    }
}

/// Stages a non-bootstrap ("peer", or in the teacher's vocabulary "AP")
/// executor passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApStage {
    /// The bootstrap executor has written this peer's entry point but it
    /// has not yet taken control.
    Spawned,
    /// The peer's early (stage 2) entry ran: CR3/TTBR switched to the
    /// kernel's page table.
    Stage2Entered,
    /// This CPU's per-CPU state (GDT/TSS equivalents, per-CPU storage
    /// pointer) is installed.
    PerCpuConfigured,
    /// Stage 3 (the peer's half of the rendezvous) has started.
    Stage3Entered,
    /// This peer has incremented the rendezvous counter and is running.
    Ready,
}

impl ApStage {
    const ORDER: &'static [ApStage] =
        &[Self::Spawned, Self::Stage2Entered, Self::PerCpuConfigured, Self::Stage3Entered, Self::Ready];

    fn index(self) -> usize {
        Self::ORDER.iter().position(|s| *s == self).expect("ApStage::ORDER is exhaustive")
    }
}

/// A strictly-forward stage tracker: each call to [`StageTracker::advance`]
/// must name the very next stage in the sequence.
///
/// # Panics
/// [`StageTracker::advance`] panics (a boot-time stage skip or regression is
/// a programmer error, not a recoverable condition) if `to` is not the
/// immediate successor of the current stage.
pub struct StageTracker<S> {
    current: S,
}

impl StageTracker<BootstrapStage> {
    /// Starts tracking at [`BootstrapStage::Init0`].
    pub const fn new() -> Self {
        Self { current: BootstrapStage::Init0 }
    }

    /// Returns the current stage.
    pub fn current(&self) -> BootstrapStage {
        self.current
    }

    /// Advances to `to`, which must be the stage immediately after the
    /// current one.
    pub fn advance(&mut self, to: BootstrapStage) {
        assert_eq!(
            to.index(),
            self.current.index() + 1,
            "bootstrap stage skipped: {:?} -> {:?}",
            self.current,
            to
        );
        self.current = to;
    }
}

impl Default for StageTracker<BootstrapStage> {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker<ApStage> {
    /// Starts tracking at [`ApStage::Spawned`].
    pub const fn new_ap() -> Self {
        Self { current: ApStage::Spawned }
    }

    /// Returns the current stage.
    pub fn current(&self) -> ApStage {
        self.current
    }

    /// Advances to `to`, which must be the stage immediately after the
    /// current one.
    pub fn advance(&mut self, to: ApStage) {
        assert_eq!(
            to.index(),
            self.current.index() + 1,
            "AP stage skipped: {:?} -> {:?}",
            self.current,
            to
        );
        self.current = to;
    }
}

impl Default for StageTracker<ApStage> {
    fn default() -> Self {
        Self::new_ap()
    }
}

/// Number of spin iterations the rendezvous waits before giving up and
/// logging a warning, rather than hanging forever on a CPU that never
/// arrives. Mirrors the teacher's `PARK_TIMEOUT`/`SPIN_TIMEOUT` constants.
pub const SPIN_TIMEOUT: u64 = 100_000_000;

/// The init-time rendezvous barrier: every peer increments `ready` once it
/// reaches [`ApStage::Ready`]; the bootstrap executor spins until every
/// peer has checked in, then proceeds.
pub struct RendezvousBarrier {
    ready: AtomicU32,
}

impl RendezvousBarrier {
    /// Creates a barrier with nobody checked in yet.
    pub const fn new() -> Self {
        Self { ready: AtomicU32::new(0) }
    }

    /// Called by a peer once it reaches [`ApStage::Ready`].
    pub fn peer_arrived(&self) {
        self.ready.fetch_add(1, Ordering::Release);
    }

    /// Returns the number of peers that have called [`RendezvousBarrier::peer_arrived`].
    pub fn arrived(&self) -> u32 {
        self.ready.load(Ordering::Acquire)
    }

    /// Called by the bootstrap executor: spins (calling `spin_hint` each
    /// iteration) until `peer_count` peers have arrived, or the timeout
    /// expires.
    ///
    /// Returns `true` if every peer arrived, `false` on timeout.
    pub fn wait_for_bootstrap(&self, peer_count: u32, mut spin_hint: impl FnMut()) -> bool {
        let mut spins = 0u64;
        while self.arrived() < peer_count {
            spin_hint();
            spins += 1;
            if spins >= SPIN_TIMEOUT {
                kwarn!(
                    "rendezvous timed out waiting for peers: {}/{} arrived",
                    self.arrived(),
                    peer_count
                );
                return false;
            }
        }
        true
    }

    /// Called by a peer after [`RendezvousBarrier::peer_arrived`]: spins
    /// until every one of `total` executors (bootstrap included) has
    /// arrived, so no peer races ahead of the bootstrap executor's
    /// "initialization complete" announcement.
    pub fn wait_for_peer(&self, total: u32, mut spin_hint: impl FnMut()) -> bool {
        let mut spins = 0u64;
        while self.arrived() < total {
            spin_hint();
            spins += 1;
            if spins >= SPIN_TIMEOUT {
                kwarn!("peer rendezvous timed out: {}/{} arrived", self.arrived(), total);
                return false;
            }
        }
        true
    }
}

impl Default for RendezvousBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    #[test]
    fn bootstrap_stage_tracker_rejects_skips() {
        let mut tracker = StageTracker::<BootstrapStage>::new();
        tracker.advance(BootstrapStage::EarlyOutput);
        assert_eq!(tracker.current(), BootstrapStage::EarlyOutput);
    }

    #[test]
    #[should_panic(expected = "bootstrap stage skipped")]
    fn bootstrap_stage_tracker_panics_on_skip() {
        let mut tracker = StageTracker::<BootstrapStage>::new();
        tracker.advance(BootstrapStage::PmmInitialized);
    }

    #[test]
    fn ap_stage_tracker_walks_in_order() {
        let mut tracker = StageTracker::<ApStage>::new_ap();
        tracker.advance(ApStage::Stage2Entered);
        tracker.advance(ApStage::PerCpuConfigured);
        tracker.advance(ApStage::Stage3Entered);
        tracker.advance(ApStage::Ready);
        assert_eq!(tracker.current(), ApStage::Ready);
    }

    /// S6: four simulated executors (one bootstrap, three peers) rendezvous
    /// through the shared barrier. The bootstrap must not observe
    /// "initialization complete" conditions satisfied until all three
    /// peers have checked in, and no peer proceeds past the barrier before
    /// every other executor (including the bootstrap) has arrived.
    #[test]
    fn s6_four_executor_rendezvous() {
        const N: u32 = 4;
        let barrier = Arc::new(RendezvousBarrier::new());
        let announced = Arc::new(AtomicBool::new(false));
        let peers_past_barrier = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..(N - 1) {
            let barrier = Arc::clone(&barrier);
            let peers_past_barrier = Arc::clone(&peers_past_barrier);
            handles.push(std::thread::spawn(move || {
                let mut stage = StageTracker::<ApStage>::new_ap();
                stage.advance(ApStage::Stage2Entered);
                stage.advance(ApStage::PerCpuConfigured);
                stage.advance(ApStage::Stage3Entered);
                barrier.peer_arrived();
                stage.advance(ApStage::Ready);
                // Peers wait for the bootstrap to also be accounted for.
                assert!(barrier.wait_for_peer(N, core::hint::spin_loop));
                peers_past_barrier.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Bootstrap executor: waits for the other N-1 to arrive, then
        // announces completion exactly once, then counts itself in.
        let mut bootstrap_stage = StageTracker::<BootstrapStage>::new();
        for stage in &BootstrapStage::ORDER[1..] {
            bootstrap_stage.advance(*stage);
            if *stage == BootstrapStage::PeersStarted {
                assert!(barrier.wait_for_bootstrap(N - 1, core::hint::spin_loop));
                assert!(!announced.swap(true, Ordering::SeqCst), "announced more than once");
            }
        }
        assert_eq!(bootstrap_stage.current(), BootstrapStage::BarrierCompleted);
        barrier.peer_arrived();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(barrier.arrived(), N);
        assert_eq!(peers_past_barrier.load(Ordering::SeqCst), (N - 1) as usize);
        assert!(announced.load(Ordering::SeqCst));
    }
}
