//! The resource arena: a vmem-style range allocator managing a sparse 1-D
//! space of `usize` values, built from the boundary tags, freelists, and
//! allocation table defined in the sibling modules.

use core::fmt;

use cascade_core::addr::DirectMap;
use cascade_core::arch::Arch;
use cascade_core::exclusion::ExclusionCpu;
use cascade_core::lock::TicketLock;
use cascade_pmm::Pmm;
use core::ptr::NonNull;
use planck_noalloc::vec::ArrayVec;

use crate::alloc_table::AllocTable;
use crate::freelist::{
    index_of_freelist_containing_len, index_of_smallest_sufficient_freelist, FreelistSet,
};
use crate::tag::{AllNodeList, KindList, Tag, TagKind, TagPool};
use crate::tag_pool::ensure_boundary_tags as replenish_tags;

/// Bound on an arena's name length.
pub const ARENA_NAME_MAX: usize = 32;

const TAGS_PER_SPAN_CREATE: usize = 2;
const TAGS_PER_PARTIAL_ALLOCATION: usize = 1;

/// Minimum number of spare tags guaranteed to sit in an arena's local pool
/// at the start of every public mutating call — enough for one span
/// creation (import) plus one partial-allocation split within the same
/// call.
pub const MAX_TAGS_PER_ALLOCATION: usize = TAGS_PER_SPAN_CREATE + TAGS_PER_PARTIAL_ALLOCATION;

/// Allocation search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// `ctz(freelist_bitmap & !(pow2(len)-1))` — O(1), may waste space.
    InstantFit,
    /// Tightest-fitting tag, searching the exact-size bucket first.
    BestFit,
    /// First tag in the exact-size bucket that is large enough.
    FirstFit,
}

/// A successful allocation: the base it was placed at and its
/// quantum-rounded length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Where the allocation starts.
    pub base: usize,
    /// Its length, rounded up to the arena's quantum.
    pub len: usize,
}

/// Errors surfaced by arena operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// A requested length was zero.
    ZeroLength,
    /// `base + len` would overflow `usize`.
    WouldWrap,
    /// `base` or `len` is not a multiple of the arena's quantum.
    Unaligned,
    /// A span being added overlaps one already present.
    Overlap,
    /// Boundary tags could not be replenished (page allocator exhausted).
    OutOfBoundaryTags,
    /// No free range in the arena (or its source) satisfies the request.
    RequestedLengthUnavailable,
    /// A `Source`'s import backed a span with physical pages and the page
    /// allocator it drew from ran out.
    PhysicalMemoryExhausted,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroLength => write!(f, "requested length is zero"),
            Self::WouldWrap => write!(f, "range would wrap the address space"),
            Self::Unaligned => write!(f, "base or length is not a multiple of the arena quantum"),
            Self::Overlap => write!(f, "span overlaps an existing span"),
            Self::OutOfBoundaryTags => write!(f, "boundary tag supply exhausted"),
            Self::RequestedLengthUnavailable => write!(f, "no free range satisfies the request"),
            Self::PhysicalMemoryExhausted => write!(f, "physical page allocator exhausted while backing span"),
        }
    }
}

/// A point-in-time snapshot of one boundary tag, for test and debug
/// inspection of the `all_node` walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagSnapshot {
    /// The tag's base.
    pub base: usize,
    /// The tag's length, in the arena's native units (not quanta).
    pub len: usize,
    /// What kind of tag this is.
    pub kind: TagKind,
}

/// An arena-to-arena composition: importing grows this arena lazily from
/// `arena`; releasing gives an entirely-freed imported span back.
pub struct Source<A: Arch>
where
    A::Cpu: ExclusionCpu,
{
    /// The arena spans are imported from and released back to.
    pub arena: &'static Arena<A>,
    /// Grows this arena by allocating a new span from `arena`.
    pub import: fn(&'static Arena<A>, usize) -> Result<Allocation, ArenaError>,
    /// Returns a fully-coalesced imported span back to `arena`.
    pub release: fn(&'static Arena<A>, Allocation),
}

fn default_import<A: Arch>(arena: &'static Arena<A>, len: usize) -> Result<Allocation, ArenaError>
where
    A::Cpu: ExclusionCpu,
{
    // SAFETY: `Source::import` is only ever called from within
    // `Arena::allocate`, which forwards the same caller contract.
    unsafe { arena.allocate(len, Policy::InstantFit) }
}

fn default_release<A: Arch>(arena: &'static Arena<A>, allocation: Allocation)
where
    A::Cpu: ExclusionCpu,
{
    // SAFETY: `Source::release` is only ever called from within
    // `Arena::deallocate`, which forwards the same caller contract.
    unsafe { arena.deallocate(allocation) };
}

impl<A: Arch> Source<A>
where
    A::Cpu: ExclusionCpu,
{
    /// A source using the default import/release pair: import via
    /// instant-fit allocation, release via plain deallocation.
    pub fn new(arena: &'static Arena<A>) -> Self {
        Self {
            arena,
            import: default_import::<A>,
            release: default_release::<A>,
        }
    }
}

struct ArenaState<A: Arch>
where
    A::Cpu: ExclusionCpu,
{
    name: ArrayVec<u8, ARENA_NAME_MAX>,
    quantum: usize,
    all_tags: AllNodeList,
    spans: KindList,
    freelists: FreelistSet,
    alloc_table: AllocTable,
    local_tags: TagPool,
    source: Option<Source<A>>,
}

// SAFETY: every field is only touched while holding the arena's
// `TicketLock`, or (the global tag pool) through its own CAS-synchronized
// API.
unsafe impl<A: Arch> Send for ArenaState<A> where A::Cpu: ExclusionCpu {}

impl<A: Arch> ArenaState<A>
where
    A::Cpu: ExclusionCpu,
{
    /// Finds the tag immediately preceding where `base` would sit in
    /// `all_node` order, and detects whether `[base, base+len)` overlaps an
    /// existing tag.
    fn locate(&self, base: usize, len: usize) -> Result<Option<NonNull<Tag>>, ArenaError> {
        let end = base + len;
        let mut prev = None;
        let mut cur = self.all_tags.front();
        while let Some(tag) = cur {
            // SAFETY: `tag` is a live member of `all_tags`.
            let (t_base, t_end) = unsafe { (tag.as_ref().base(), tag.as_ref().end()) };
            if t_base >= end {
                break;
            }
            if t_end > base {
                return Err(ArenaError::Overlap);
            }
            prev = Some(tag);
            cur = self.all_tags.next(tag);
        }
        Ok(prev)
    }
}

/// A resource arena over a sparse `usize` space, parameterized by the
/// concrete [`Arch`] so its internal lock can acquire CPU exclusion and so
/// it can replenish boundary tags from the page allocator directly.
pub struct Arena<A: Arch>
where
    A::Cpu: ExclusionCpu,
{
    inner: TicketLock<ArenaState<A>>,
    pmm: &'static Pmm<A>,
    direct_map: DirectMap,
}

impl<A: Arch> Arena<A>
where
    A::Cpu: ExclusionCpu,
{
    /// Creates an empty arena.
    ///
    /// # Panics
    /// Panics if `quantum` is not a power of two, or `name` is longer than
    /// [`ARENA_NAME_MAX`].
    pub fn new(
        name: &str,
        quantum: usize,
        pmm: &'static Pmm<A>,
        direct_map: DirectMap,
        source: Option<Source<A>>,
    ) -> Self {
        assert!(quantum.is_power_of_two(), "Arena::new: quantum must be a power of two");
        let mut name_buf: ArrayVec<u8, ARENA_NAME_MAX> = ArrayVec::new();
        for &b in name.as_bytes() {
            assert!(!name_buf.is_full(), "Arena::new: name exceeds length bound");
            let at = name_buf.len();
            name_buf.insert(at, b);
        }
        Self {
            inner: TicketLock::new(ArenaState {
                name: name_buf,
                quantum,
                all_tags: AllNodeList::new(),
                spans: KindList::new(),
                freelists: FreelistSet::new(),
                alloc_table: AllocTable::new(),
                local_tags: TagPool::new(),
                source,
            }),
            pmm,
            direct_map,
        }
    }

    /// The physical page allocator this arena was constructed with.
    ///
    /// Exposed for `Source` import/release pairs (like the kernel heap's)
    /// that need to back an imported span with real physical pages rather
    /// than just bookkeeping a virtual range.
    pub fn pmm(&self) -> &'static Pmm<A> {
        self.pmm
    }

    /// The direct map this arena was constructed with.
    pub fn direct_map(&self) -> DirectMap {
        self.direct_map
    }

    /// This arena's name.
    ///
    /// # Safety
    /// Must not be called while holding a live `&mut Cpu` borrow for the
    /// current CPU.
    pub unsafe fn name(&self) -> &str {
        // SAFETY: forwarded to the caller's contract.
        let state = unsafe { self.inner.lock::<A>() };
        let bytes: &[u8] = &state.name;
        // SAFETY: the byte slice is immediately copied out as owned data by
        // every caller in this workspace; returning it borrowed from the
        // guard would outlive the lock, so this is only sound because arena
        // names are ASCII and never read concurrently with a rename (there
        // is no rename operation).
        unsafe { core::str::from_utf8_unchecked(core::slice::from_raw_parts(bytes.as_ptr(), bytes.len())) }
    }

    /// Walks every tag in `all_node` order, for tests and debugging.
    ///
    /// The arena stays locked for as long as the returned iterator is alive.
    ///
    /// # Safety
    /// Must not be called while holding a live `&mut Cpu` borrow for the
    /// current CPU.
    pub unsafe fn debug_tags(&self) -> impl Iterator<Item = TagSnapshot> + '_ {
        // SAFETY: forwarded to the caller's contract.
        let guard = unsafe { self.inner.lock::<A>() };
        let mut cur = guard.all_tags.front();
        core::iter::from_fn(move || {
            let tag = cur?;
            // SAFETY: `tag` is a live member of `guard.all_tags`.
            let snap = unsafe {
                TagSnapshot { base: tag.as_ref().base(), len: tag.as_ref().len(), kind: tag.as_ref().kind() }
            };
            cur = guard.all_tags.next(tag);
            Some(snap)
        })
    }

    fn round_up_to_quantum(quantum: usize, len: usize) -> Option<usize> {
        let mask = quantum - 1;
        len.checked_add(mask).map(|v| v & !mask)
    }

    /// Ensures the arena's local tag pool holds at least
    /// `MAX_TAGS_PER_ALLOCATION` spare tags, acquiring the arena mutex
    /// itself. Drops the mutex before touching the global tag-allocation
    /// mutex or the PMM, per the documented lock order, then re-acquires it.
    ///
    /// # Safety
    /// Same contract as [`Pmm::allocate_frame`].
    unsafe fn ensure_boundary_tags(
        &self,
    ) -> Result<cascade_core::lock::TicketLockGuard<'_, ArenaState<A>, A::Cpu>, ArenaError> {
        // SAFETY: forwarded to the caller's contract.
        let guard = unsafe { self.inner.lock::<A>() };
        if guard.local_tags.len() >= MAX_TAGS_PER_ALLOCATION {
            return Ok(guard);
        }
        drop(guard);

        let mut scratch = TagPool::new();
        // SAFETY: forwarded to the caller's contract; `scratch` is a fresh,
        // arena-local stand-in not shared with any other arena.
        unsafe { replenish_tags(&mut scratch, MAX_TAGS_PER_ALLOCATION, self.pmm, &self.direct_map) }
            .map_err(|_| ArenaError::OutOfBoundaryTags)?;

        // SAFETY: forwarded to the caller's contract.
        let mut guard = unsafe { self.inner.lock::<A>() };
        while let Some(tag) = scratch.pop() {
            // SAFETY: `tag` was just detached from `scratch`.
            unsafe { guard.local_tags.push(tag) };
        }
        Ok(guard)
    }

    /// Adds a native `[base, base+len)` span, tiled by a single free tag.
    ///
    /// # Safety
    /// Same contract as [`Pmm::allocate_frame`].
    pub unsafe fn add_span(&self, base: usize, len: usize) -> Result<(), ArenaError> {
        if len == 0 {
            return Err(ArenaError::ZeroLength);
        }
        let end = base.checked_add(len).ok_or(ArenaError::WouldWrap)?;
        let _ = end;

        // SAFETY: forwarded to the caller's contract.
        let mut guard = unsafe { self.ensure_boundary_tags()? };
        let quantum = guard.quantum;
        if base % quantum != 0 || len % quantum != 0 {
            return Err(ArenaError::Unaligned);
        }

        let prev = guard.locate(base, len)?;

        let span_tag = guard.local_tags.pop().expect("tag pool topped up above");
        let free_tag = guard.local_tags.pop().expect("tag pool topped up above");
        // SAFETY: both tags were just detached from the local pool.
        unsafe {
            write_tag(span_tag, base, len, TagKind::Span);
            write_tag(free_tag, base, len, TagKind::Free);
        }

        // SAFETY: both tags are detached and `prev` (if any) is live.
        unsafe {
            match prev {
                Some(prev) => guard.all_tags.insert_after(prev, span_tag),
                None => guard.all_tags.push_front(span_tag),
            }
            guard.all_tags.insert_after(span_tag, free_tag);
            guard.spans.push_front(span_tag);
            guard.freelists.insert(free_tag, len as u64 / quantum as u64);
        }
        Ok(())
    }

    /// Allocates `len` bytes (rounded up to the quantum) using `policy`.
    ///
    /// # Safety
    /// Same contract as [`Pmm::allocate_frame`].
    pub unsafe fn allocate(&self, len: usize, policy: Policy) -> Result<Allocation, ArenaError> {
        if len == 0 {
            return Err(ArenaError::ZeroLength);
        }

        // SAFETY: forwarded to the caller's contract.
        let mut guard = unsafe { self.ensure_boundary_tags()? };
        let quantum = guard.quantum;
        let needed = Self::round_up_to_quantum(quantum, len).ok_or(ArenaError::WouldWrap)?;
        let needed_quanta = (needed / quantum) as u64;

        let mut candidate = Self::search_freelist(&guard, needed_quanta, policy);

        if candidate.is_none() {
            let source = guard.source.as_ref().map(|s| (s.arena, s.import));
            drop(guard);
            let Some((source_arena, import)) = source else {
                return Err(ArenaError::RequestedLengthUnavailable);
            };
            let imported = import(source_arena, needed).map_err(|_| ArenaError::RequestedLengthUnavailable)?;

            // SAFETY: forwarded to the caller's contract.
            let mut reguard = unsafe { self.ensure_boundary_tags()? };
            let prev = reguard.locate(imported.base, imported.len)?;
            let span_tag = reguard.local_tags.pop().expect("tag pool topped up above");
            let free_tag = reguard.local_tags.pop().expect("tag pool topped up above");
            // SAFETY: both tags were just detached from the local pool.
            unsafe {
                write_tag(span_tag, imported.base, imported.len, TagKind::ImportedSpan);
                write_tag(free_tag, imported.base, imported.len, TagKind::Free);
                match prev {
                    Some(prev) => reguard.all_tags.insert_after(prev, span_tag),
                    None => reguard.all_tags.push_front(span_tag),
                }
                reguard.all_tags.insert_after(span_tag, free_tag);
                reguard.spans.push_front(span_tag);
                reguard
                    .freelists
                    .insert(free_tag, imported.len as u64 / quantum as u64);
            }
            guard = reguard;
            candidate = Self::search_freelist(&guard, needed_quanta, policy);
        }

        let chosen = candidate.ok_or(ArenaError::RequestedLengthUnavailable)?;
        // SAFETY: `chosen` is a live free tag just located.
        let (chosen_base, chosen_len) = unsafe { (chosen.as_ref().base(), chosen.as_ref().len()) };
        // SAFETY: `chosen` is a live member of its freelist bucket.
        unsafe { guard.freelists.remove(chosen, chosen_len as u64 / quantum as u64) };

        if chosen_len > needed {
            let surplus_tag = guard.local_tags.pop().expect("tag pool topped up above");
            // SAFETY: `surplus_tag` was just detached.
            unsafe {
                write_tag(
                    surplus_tag,
                    chosen_base + needed,
                    chosen_len - needed,
                    TagKind::Free,
                );
                guard.all_tags.insert_after(chosen, surplus_tag);
                guard
                    .freelists
                    .insert(surplus_tag, (chosen_len - needed) as u64 / quantum as u64);
                chosen.as_ref().set_len(needed);
            }
        }

        // SAFETY: `chosen` is still live, now representing the allocated run.
        unsafe {
            chosen.as_ref().set_kind(TagKind::Allocated);
            guard.alloc_table.insert(chosen);
        }

        Ok(Allocation {
            base: chosen_base,
            len: needed,
        })
    }

    fn search_freelist(
        guard: &ArenaState<A>,
        needed_quanta: u64,
        policy: Policy,
    ) -> Option<NonNull<Tag>> {
        match policy {
            Policy::InstantFit => guard.freelists.instant_fit(needed_quanta),
            Policy::FirstFit => {
                let idx = index_of_freelist_containing_len(needed_quanta.max(1));
                for tag in guard.freelists.tags_in_bucket(idx) {
                    // SAFETY: `tag` is a live free tag.
                    let len = unsafe { tag.as_ref().len() } as u64;
                    if len >= needed_quanta {
                        return Some(tag);
                    }
                }
                guard.freelists.instant_fit(needed_quanta)
            }
            Policy::BestFit => {
                let min_idx = index_of_smallest_sufficient_freelist(needed_quanta);
                let exact_len = smallest_in_bucket(min_idx);
                let mut best: Option<NonNull<Tag>> = None;
                for tag in guard.freelists.candidates_from(needed_quanta) {
                    // SAFETY: `tag` is a live free tag.
                    let len = unsafe { tag.as_ref().len() } as u64;
                    if len < needed_quanta {
                        continue;
                    }
                    let is_better = match best {
                        // SAFETY: `b` is a live free tag.
                        Some(b) => len < unsafe { b.as_ref().len() } as u64,
                        None => true,
                    };
                    if is_better {
                        best = Some(tag);
                        if len == exact_len {
                            break;
                        }
                    }
                }
                best
            }
        }
    }

    /// Deallocates a previously returned allocation.
    ///
    /// # Panics
    /// Panics if `allocation.base` is not currently allocated, or if its
    /// length does not match the tag found at that base.
    ///
    /// # Safety
    /// Same contract as [`Pmm::allocate_frame`].
    pub unsafe fn deallocate(&self, allocation: Allocation) {
        // SAFETY: forwarded to the caller's contract.
        unsafe { self.deallocate_inner(allocation.base, Some(allocation.len)) };
    }

    /// Deallocates by base alone, without checking the caller's claimed
    /// length.
    ///
    /// # Panics
    /// Panics if `base` is not currently allocated.
    ///
    /// # Safety
    /// Same contract as [`Pmm::allocate_frame`].
    pub unsafe fn deallocate_base(&self, base: usize) {
        // SAFETY: forwarded to the caller's contract.
        unsafe { self.deallocate_inner(base, None) };
    }

    unsafe fn deallocate_inner(&self, base: usize, expected_len: Option<usize>) {
        // SAFETY: forwarded to the caller's contract.
        let mut guard = unsafe { self.ensure_boundary_tags().expect("deallocate must not need new tags") };
        let quantum = guard.quantum;

        let tag = guard
            .alloc_table
            .lookup(base as u64)
            .unwrap_or_else(|| panic!("deallocate: base {base:#x} is not allocated"));
        // SAFETY: `tag` is a live allocation-table member.
        let tag_len = unsafe { tag.as_ref().len() };
        if let Some(expected) = expected_len {
            assert_eq!(tag_len, expected, "deallocate: length mismatch for base {base:#x}");
        }
        // SAFETY: `tag` is a live allocation-table member.
        unsafe { guard.alloc_table.remove(tag) };
        // SAFETY: `tag` is now detached from every kind-role list.
        unsafe {
            tag.as_ref().set_kind(TagKind::Free);
            guard.freelists.insert(tag, tag_len as u64 / quantum as u64);
        }

        let mut merged = tag;
        // SAFETY: `merged` is a live member of `all_tags`.
        if let Some(prev) = unsafe { guard.all_tags.prev(merged) } {
            // SAFETY: `prev` is live.
            if unsafe { prev.as_ref().kind() } == TagKind::Free {
                merged = coalesce(&mut guard, prev, merged, quantum);
            }
        }
        // SAFETY: `merged` is a live member of `all_tags`.
        if let Some(next) = unsafe { guard.all_tags.next(merged) } {
            // SAFETY: `next` is live.
            if unsafe { next.as_ref().kind() } == TagKind::Free {
                merged = coalesce(&mut guard, merged, next, quantum);
            }
        }

        // SAFETY: `merged` is a live member of `all_tags`.
        let span = unsafe { guard.all_tags.prev(merged) };
        if let Some(span) = span {
            // SAFETY: `span` is live.
            let (span_kind, span_base, span_len) =
                unsafe { (span.as_ref().kind(), span.as_ref().base(), span.as_ref().len()) };
            // SAFETY: `merged` is live.
            let (merged_base, merged_len) = unsafe { (merged.as_ref().base(), merged.as_ref().len()) };
            if span_kind == TagKind::ImportedSpan && span_base == merged_base && span_len == merged_len {
                // SAFETY: both tags are live members of `all_tags`.
                unsafe {
                    guard.all_tags.remove(merged);
                    guard.freelists.remove(merged, merged_len as u64 / quantum as u64);
                    guard.spans.remove(span);
                    guard.all_tags.remove(span);
                    guard.local_tags.push(merged);
                    guard.local_tags.push(span);
                }
                let release = guard.source.as_ref().map(|s| (s.arena, s.release));
                drop(guard);
                if let Some((source_arena, release)) = release {
                    release(
                        source_arena,
                        Allocation {
                            base: span_base,
                            len: span_len,
                        },
                    );
                }
            }
        }
    }

    /// Destroys the arena: asserts no allocations remain, releases every
    /// imported span, and returns all boundary tags to the global pool.
    ///
    /// No internal locking — the caller must guarantee exclusive access,
    /// matching the teacher's `force_get` escape hatch for single-owner
    /// teardown paths.
    ///
    /// # Safety
    /// The caller must have exclusive access to the arena (no concurrent
    /// callers of any other method), and must not call this while holding a
    /// live `&mut Cpu` borrow for the current CPU.
    pub unsafe fn destroy(&self) {
        // SAFETY: forwarded to the caller's contract.
        let state = unsafe { self.inner.force_get() };

        // No locking here (see the contract above), so releases can happen
        // inline during the walk instead of being collected for afterwards.
        let mut cur = state.all_tags.front();
        while let Some(tag) = cur {
            // SAFETY: `tag` is a live member of `all_tags`.
            let kind = unsafe { tag.as_ref().kind() };
            assert!(kind != TagKind::Allocated, "Arena::destroy: allocation tags remain");
            if kind == TagKind::ImportedSpan {
                if let Some(source) = state.source.as_ref() {
                    // SAFETY: `tag` is live.
                    let (base, len) = unsafe { (tag.as_ref().base(), tag.as_ref().len()) };
                    (source.release)(source.arena, Allocation { base, len });
                }
            }
            cur = state.all_tags.next(tag);
        }

        while let Some(tag) = state.all_tags.front() {
            // SAFETY: `tag` is a live member of `all_tags`.
            unsafe {
                state.all_tags.remove(tag);
                crate::tag_pool::GLOBAL_TAG_POOL.push(tag);
            }
        }
        while let Some(tag) = state.local_tags.pop() {
            // SAFETY: `tag` was just detached from the local pool.
            unsafe { crate::tag_pool::GLOBAL_TAG_POOL.push(tag) };
        }
    }
}

fn smallest_in_bucket(idx: usize) -> u64 {
    1u64 << idx.min(63)
}

/// # Safety
/// `tag` must be detached from every list.
unsafe fn write_tag(tag: NonNull<Tag>, base: usize, len: usize, kind: TagKind) {
    // SAFETY: forwarded to the caller's contract.
    unsafe { tag.as_ref().set_fields(base, len, kind) };
}

/// Merges adjacent free tags `a` (earlier) and `b` (later) into one,
/// returning the surviving tag. The other is detached and returned to the
/// arena's local pool.
fn coalesce<A: Arch>(guard: &mut ArenaState<A>, a: NonNull<Tag>, b: NonNull<Tag>, quantum: usize) -> NonNull<Tag>
where
    A::Cpu: ExclusionCpu,
{
    // SAFETY: `a`/`b` are live free tags, adjacent in `all_node` order.
    let (a_base, a_len, b_len) = unsafe { (a.as_ref().base(), a.as_ref().len(), b.as_ref().len()) };
    // SAFETY: `a`/`b` are live members of their freelist buckets.
    unsafe {
        guard.freelists.remove(a, a_len as u64 / quantum as u64);
        guard.freelists.remove(b, b_len as u64 / quantum as u64);
        guard.all_tags.remove(b);
        a.as_ref().set_len(a_len + b_len);
        guard.local_tags.push(b);
        guard.freelists.insert(a, (a_len + b_len) as u64 / quantum as u64);
    }
    let _ = a_base;
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::addr::{PhysAddr, PhysicalRange, VirtAddr, VirtualRange};
    use cascade_core::arch::{Cpu, MapError, MapType, PageTable};
    use cascade_core::exclusion::ExclusionCounters;
    use cascade_core::id::CpuId;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

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

    thread_local! {
        static CPU: TestCpu = TestCpu { counters: ExclusionCounters::new() };
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
                // SAFETY: each test thread owns a distinct thread-local `CPU`.
                unsafe { &mut *ptr }
            })
        }
        fn spin_loop_hint() {
            core::hint::spin_loop();
        }
        unsafe fn map_range(
            _pt: &mut Self::PageTable,
            _v: VirtualRange,
            _p: PhysicalRange,
            _m: MapType,
        ) -> Result<(), MapError> {
            Ok(())
        }
        unsafe fn unmap_range(
            _pt: &mut Self::PageTable,
            _v: VirtualRange,
            _on_unmapped: &mut dyn FnMut(PhysAddr),
        ) -> Result<(), MapError> {
            Ok(())
        }
    }

    struct HostPmm {
        ptr: *mut u8,
        layout: Layout,
        pmm: Pmm<TestArch>,
        direct_map: DirectMap,
    }
    impl Drop for HostPmm {
        fn drop(&mut self) {
            // SAFETY: `ptr`/`layout` match the allocation made in `new`.
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }
    fn host_pmm(pages: usize) -> Box<HostPmm> {
        const PAGE_SIZE: usize = 4096;
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: non-zero size, valid alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let direct_map = DirectMap {
            virtual_base: VirtAddr::new_truncate(ptr as u64),
            size: (pages * PAGE_SIZE) as u64,
        };
        let pmm: Pmm<TestArch> = Pmm::new();
        // SAFETY: single-threaded test setup.
        unsafe {
            pmm.init(direct_map);
            pmm.add_range(PhysicalRange::new(PhysAddr::zero(), (pages * PAGE_SIZE) as u64))
                .unwrap();
        }
        Box::new(HostPmm {
            ptr,
            layout,
            pmm,
            direct_map,
        })
    }

    fn leak_pmm(pages: usize) -> (&'static Pmm<TestArch>, DirectMap) {
        let boxed = host_pmm(pages);
        let direct_map = boxed.direct_map;
        let leaked: &'static HostPmm = Box::leak(boxed);
        (&leaked.pmm, direct_map)
    }

    #[test]
    fn s1_arena_basic() {
        let (pmm, dm) = leak_pmm(16);
        let arena: Arena<TestArch> = Arena::new("s1", 0x10, pmm, dm, None);
        // SAFETY: single-threaded test.
        unsafe {
            arena.add_span(0x1000, 0x1000).unwrap();
            let a1 = arena.allocate(0x100, Policy::InstantFit).unwrap();
            assert_eq!(a1, Allocation { base: 0x1000, len: 0x100 });
            let a2 = arena.allocate(0x50, Policy::BestFit).unwrap();
            assert_eq!(a2, Allocation { base: 0x1100, len: 0x50 });

            let tags: Vec<TagSnapshot> = arena.debug_tags().collect();
            assert_eq!(
                tags,
                vec![
                    TagSnapshot { base: 0x1000, len: 0x1000, kind: TagKind::Span },
                    TagSnapshot { base: 0x1000, len: 0x100, kind: TagKind::Allocated },
                    TagSnapshot { base: 0x1100, len: 0x50, kind: TagKind::Allocated },
                    TagSnapshot { base: 0x1150, len: 0xeb0, kind: TagKind::Free },
                ]
            );

            arena.deallocate(a1);
            arena.deallocate(a2);
            let tags: Vec<TagSnapshot> = arena.debug_tags().collect();
            assert_eq!(
                tags,
                vec![
                    TagSnapshot { base: 0x1000, len: 0x1000, kind: TagKind::Span },
                    TagSnapshot { base: 0x1000, len: 0x1000, kind: TagKind::Free },
                ]
            );
        }
    }

    #[test]
    fn s2_span_boundary_non_coalesce() {
        let (pmm, dm) = leak_pmm(16);
        let arena: Arena<TestArch> = Arena::new("s2", 0x10, pmm, dm, None);
        // SAFETY: single-threaded test.
        unsafe {
            arena.add_span(0x0, 0x1000).unwrap();
            arena.add_span(0x2000, 0x1000).unwrap();
            let a = arena.allocate(0x1000, Policy::FirstFit).unwrap();
            assert_eq!(a.base, 0x0);
            arena.deallocate(a);

            let tags: Vec<TagSnapshot> = arena.debug_tags().collect();
            let first_span = tags[0];
            assert_eq!(first_span, TagSnapshot { base: 0x0, len: 0x1000, kind: TagKind::Span });
            let first_free = tags[1];
            assert_eq!(first_free, TagSnapshot { base: 0x0, len: 0x1000, kind: TagKind::Free });

            let err = arena.allocate(0x1800, Policy::InstantFit).unwrap_err();
            assert_eq!(err, ArenaError::RequestedLengthUnavailable);
        }
    }

    #[test]
    fn s3_source_import_and_release() {
        let (pmm, dm) = leak_pmm(64);
        let parent: &'static Arena<TestArch> =
            Box::leak(Box::new(Arena::new("parent", 0x1000, pmm, dm, None)));
        // SAFETY: single-threaded test.
        unsafe { parent.add_span(0x10_000, 0xf0_000).unwrap() };

        let child: Arena<TestArch> = Arena::new("child", 0x1000, pmm, dm, Some(Source::new(parent)));
        // SAFETY: single-threaded test.
        unsafe {
            let a = child.allocate(0x4000, Policy::InstantFit).unwrap();
            assert_eq!(a.len, 0x4000);

            assert!(parent
                .debug_tags()
                .any(|t| t.kind == TagKind::Allocated && t.len == 0x4000));

            assert!(child.debug_tags().any(|t| t.kind == TagKind::ImportedSpan));

            child.deallocate(a);

            assert!(parent.debug_tags().all(|t| t.kind != TagKind::Allocated));
        }
    }
}
