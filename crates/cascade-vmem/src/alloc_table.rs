//! The allocation table: a fixed-size hash table mapping an allocated run's
//! `base` back to its boundary tag, so `deallocate_base` doesn't need to
//! walk `all_node`.

use crate::tag::{KindList, Tag};
use core::ptr::NonNull;

/// Number of allocation-table buckets. Matches the freelist bucket count;
/// there's no requirement that they match, it just keeps one constant in
/// the caller's head instead of two.
pub const NUM_BUCKETS: usize = 64;

/// A cheap, fixed-output mix of `base`, in the style of wyhash's final
/// mixing step: two multiply-xorshifts are enough to spread an
/// allocation's base address uniformly across the buckets without pulling
/// in a hashing crate this `no_std` layer can't depend on.
fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

fn bucket_of(base: u64) -> usize {
    (mix(base) % NUM_BUCKETS as u64) as usize
}

/// The allocation table itself: `NUM_BUCKETS` independent hash chains.
pub struct AllocTable {
    buckets: [KindList; NUM_BUCKETS],
}

impl AllocTable {
    pub const fn new() -> Self {
        Self {
            buckets: [const { KindList::new() }; NUM_BUCKETS],
        }
    }

    /// Inserts `tag` (already marked `TagKind::Allocated`) keyed by its own
    /// base address.
    ///
    /// # Safety
    /// `tag` must be detached from every kind-role list.
    pub unsafe fn insert(&mut self, tag: NonNull<Tag>) {
        // SAFETY: `tag` is live for the duration of this call.
        let base = unsafe { tag.as_ref().base() } as u64;
        let idx = bucket_of(base);
        // SAFETY: forwarded to caller's contract.
        unsafe { self.buckets[idx].push_front(tag) };
    }

    /// Looks up the tag allocated at exactly `base`, without removing it.
    pub fn lookup(&self, base: u64) -> Option<NonNull<Tag>> {
        let idx = bucket_of(base);
        let mut cur = self.buckets[idx].front();
        while let Some(tag) = cur {
            // SAFETY: every tag reachable through this bucket is live.
            if unsafe { tag.as_ref().base() } as u64 == base {
                return Some(tag);
            }
            cur = self.buckets[idx].next(tag);
        }
        None
    }

    /// Removes `tag` from its bucket.
    ///
    /// # Safety
    /// `tag` must be a live member of this table, previously inserted via
    /// `insert`.
    pub unsafe fn remove(&mut self, tag: NonNull<Tag>) {
        // SAFETY: `tag` is live for the duration of this call.
        let base = unsafe { tag.as_ref().base() } as u64;
        let idx = bucket_of(base);
        // SAFETY: forwarded to caller's contract.
        unsafe { self.buckets[idx].remove(tag) };
    }
}

impl Default for AllocTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{Tag, TagKind};
    use std::boxed::Box;

    fn leaked_tag(base: usize, len: usize) -> NonNull<Tag> {
        let tag = Tag::blank();
        // SAFETY: freshly constructed, detached tag.
        unsafe { tag.set_fields(base, len, TagKind::Allocated) };
        NonNull::new(Box::into_raw(Box::new(tag))).unwrap()
    }

    #[test]
    fn insert_and_lookup_roundtrip() {
        let mut table = AllocTable::new();
        let tags: Vec<_> = (0..200u64).map(|i| leaked_tag((i * 0x10) as usize, 0x10)).collect();
        for &tag in &tags {
            // SAFETY: freshly allocated, detached tags.
            unsafe { table.insert(tag) };
        }
        for (i, &tag) in tags.iter().enumerate() {
            let found = table.lookup((i as u64) * 0x10).expect("present");
            assert_eq!(found, tag);
        }
        assert!(table.lookup(0xdead_beef).is_none());

        for &tag in &tags {
            // SAFETY: every tag is still a live member of `table`.
            unsafe { table.remove(tag) };
        }
        for &tag in &tags {
            // SAFETY: reclaiming ownership of leaked tags.
            unsafe { drop(Box::from_raw(tag.as_ptr())) };
        }
    }

    #[test]
    fn remove_detaches_from_bucket() {
        let mut table = AllocTable::new();
        let tag = leaked_tag(0x1000, 0x10);
        // SAFETY: freshly allocated, detached tag.
        unsafe { table.insert(tag) };
        assert!(table.lookup(0x1000).is_some());
        // SAFETY: `tag` is a live member of `table`.
        unsafe { table.remove(tag) };
        assert!(table.lookup(0x1000).is_none());
        // SAFETY: reclaiming ownership.
        unsafe { drop(Box::from_raw(tag.as_ptr())) };
    }
}
