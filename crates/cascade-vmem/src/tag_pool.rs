//! Boundary-tag supply: the protocol that keeps every arena stocked with
//! spare [`Tag`]s without ever allocating tag storage through another
//! arena (that would be circular — tags describe arena state, they can't
//! themselves come from one).
//!
//! Three tiers, cheapest first:
//! 1. an arena's own local [`TagPool`], touched only while holding that
//!    arena's lock;
//! 2. a lock-free global pool shared by every arena, so one arena's
//!    surplus can refill another's shortfall without a page allocation;
//! 3. the page-frame allocator itself, carving a freshly allocated page
//!    into `TAGS_PER_PAGE` blank tags, guarded by a dedicated mutex so two
//!    starved arenas don't both allocate a page when one would do.

use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};
use core::ptr;

use cascade_core::addr::DirectMap;
use cascade_core::arch::Arch;
use cascade_core::exclusion::ExclusionCpu;
use cascade_core::lock::TicketLock;

use crate::tag::{Tag, TagPool};
use cascade_pmm::{Pmm, PmmError};

/// How many tags fit in one standard page.
pub const TAGS_PER_PAGE: usize = 4096 / size_of::<Tag>();

/// How many freshly carved tags a replenishing arena keeps for itself;
/// the rest go to the global pool for other arenas.
const LOCAL_REFILL_COUNT: usize = 4;

/// A lock-free, cross-arena pool of unused tags threaded through `Tag`'s
/// `pool_next` field.
///
/// A Treiber stack: `head` is the only location ever touched with atomic
/// ops. A node's `pool_next` is written by whichever thread currently owns
/// it (either about to publish it via `push`, or having just taken
/// ownership via a successful `pop`'s CAS), so plain reads/writes of that
/// field never race — the `AtomicPtr`'s acquire/release pairing is what
/// makes that ownership handoff sound.
pub struct GlobalTagPool {
    head: AtomicPtr<Tag>,
}

impl GlobalTagPool {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `tag` onto the pool.
    ///
    /// # Safety
    /// `tag` must be detached from every list.
    pub unsafe fn push(&self, tag: NonNull<Tag>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `tag` is exclusively owned by this call until published.
            unsafe { tag.as_ref().set_pool_next(NonNull::new(head)) };
            match self
                .head
                .compare_exchange_weak(head, tag.as_ptr(), Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops a tag from the pool, if any is available.
    pub fn pop(&self) -> Option<NonNull<Tag>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let head_ptr = NonNull::new(head)?;
            // SAFETY: `head_ptr` was published by a prior `push` and has not
            // yet been popped (we are the only reader racing the CAS below).
            let next = unsafe { head_ptr.as_ref().pool_next() };
            let next_raw = next.map_or(ptr::null_mut(), |n| n.as_ptr());
            match self
                .head
                .compare_exchange_weak(head, next_raw, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Some(head_ptr),
                Err(actual) => head = actual,
            }
        }
    }
}

impl Default for GlobalTagPool {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the stack is only ever mutated through the atomic `head` pointer;
// see the `GlobalTagPool` doc comment for why `pool_next` itself needs no
// atomics.
unsafe impl Send for GlobalTagPool {}
unsafe impl Sync for GlobalTagPool {}

/// The process-wide tag pool shared by every arena.
pub static GLOBAL_TAG_POOL: GlobalTagPool = GlobalTagPool::new();

/// Serializes boundary-tag page replenishment so two starved arenas never
/// both allocate a fresh page when draining the global pool would have
/// sufficed.
///
/// Not generic over `Arch`: exactly one of these exists process-wide, and
/// `Arch` is supplied at each `.lock::<A>()` call site, matching
/// [`TicketLock`]'s own design.
pub static GLOBAL_TAG_ALLOC_MUTEX: TicketLock<()> = TicketLock::new(());

/// Ensures `local` holds at least `needed` spare tags, replenishing from
/// the global pool or, failing that, a freshly allocated page.
///
/// `needed` should be `MAX_TAGS_PER_ALLOCATION`; a single call may overshoot
/// it when a page is carved, since the whole page's worth beyond
/// `LOCAL_REFILL_COUNT` goes to the global pool regardless.
///
/// # Safety
/// Same contract as [`Pmm::allocate_frame`]: must not be called while
/// holding a live `&mut Cpu` borrow for the current CPU, and `direct_map`
/// must be the direct map backing `pmm`.
pub unsafe fn ensure_boundary_tags<A: Arch>(
    local: &mut TagPool,
    needed: usize,
    pmm: &Pmm<A>,
    direct_map: &DirectMap,
) -> Result<(), PmmError>
where
    A::Cpu: ExclusionCpu,
{
    while local.len() < needed {
        if let Some(tag) = GLOBAL_TAG_POOL.pop() {
            // SAFETY: `tag` was just detached from the global pool.
            unsafe { local.push(tag) };
            continue;
        }

        // SAFETY: forwarded to the caller's contract.
        let _guard = unsafe { GLOBAL_TAG_ALLOC_MUTEX.lock::<A>() };

        if let Some(tag) = GLOBAL_TAG_POOL.pop() {
            // SAFETY: `tag` was just detached from the global pool.
            unsafe { local.push(tag) };
            continue;
        }

        // SAFETY: forwarded to the caller's contract.
        let frame = unsafe { pmm.allocate_frame()? };
        let base = direct_map.to_virt(frame.start_address()).as_mut_ptr::<Tag>();

        // SAFETY: `base` points to a freshly allocated, exclusively-owned
        // page, large enough for `TAGS_PER_PAGE` tags
        // (`TAGS_PER_PAGE * size_of::<Tag>() <= 4096` by construction).
        for i in 0..TAGS_PER_PAGE {
            unsafe { base.add(i).write(Tag::blank()) };
        }

        for i in 0..TAGS_PER_PAGE {
            // SAFETY: just initialized above.
            let tag = unsafe { NonNull::new_unchecked(base.add(i)) };
            if i < LOCAL_REFILL_COUNT {
                // SAFETY: `tag` is a fresh, detached tag.
                unsafe { local.push(tag) };
            } else {
                // SAFETY: same.
                unsafe { GLOBAL_TAG_POOL.push(tag) };
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::Tag;
    use std::boxed::Box;

    fn leaked_tag() -> NonNull<Tag> {
        NonNull::new(Box::into_raw(Box::new(Tag::blank()))).unwrap()
    }

    #[test]
    fn global_pool_is_lifo_under_single_thread() {
        let pool = GlobalTagPool::new();
        let a = leaked_tag();
        let b = leaked_tag();
        // SAFETY: freshly allocated, detached tags.
        unsafe {
            pool.push(a);
            pool.push(b);
        }
        assert_eq!(pool.pop(), Some(b));
        assert_eq!(pool.pop(), Some(a));
        assert!(pool.pop().is_none());

        for ptr in [a, b] {
            // SAFETY: reclaiming ownership.
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
    }

    #[test]
    fn global_pool_survives_concurrent_push_pop() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};

        let pool = Arc::new(GlobalTagPool::new());
        let tags: Vec<_> = (0..64).map(|_| leaked_tag()).collect();
        for &tag in &tags {
            // SAFETY: freshly allocated, detached tags.
            unsafe { pool.push(tag) };
        }

        let popped: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let popped = Arc::clone(&popped);
                std::thread::spawn(move || {
                    for _ in 0..8 {
                        if let Some(tag) = pool.pop() {
                            let addr = tag.as_ptr() as usize;
                            assert!(popped.lock().unwrap().insert(addr), "tag popped twice");
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(popped.lock().unwrap().len(), 64);
        assert!(pool.pop().is_none());

        for &tag in &tags {
            // SAFETY: reclaiming ownership; every tag was popped above.
            unsafe { drop(Box::from_raw(tag.as_ptr())) };
        }
    }
}
