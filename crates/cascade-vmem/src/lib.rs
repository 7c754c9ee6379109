//! Vmem-style boundary-tag resource arenas.
//!
//! An [`arena::Arena`] manages a sparse 1-D space of `usize` values (virtual
//! addresses, physical page numbers, minor numbers, whatever the caller's
//! quantum means) using the Bonwick/Adams vmem algorithm: boundary tags
//! threaded through two independent intrusive lists per tag
//! ([`tag::AllNodeList`] ordered by base, and exactly one of
//! [`freelist::FreelistSet`] / [`alloc_table::AllocTable`] / the span list),
//! power-of-two segregated freelists for near-O(1) instant-fit allocation,
//! and a hash-bucketed allocation table for O(1) `deallocate_base`.
//!
//! Arenas compose: one arena can source its spans from another via
//! [`arena::Source`], the way a kernel heap sources pages from a virtual
//! address arena that in turn sources physical frames from the page
//! allocator.

#![cfg_attr(not(test), no_std)]

pub mod alloc_table;
pub mod arena;
pub mod freelist;
pub mod tag;
pub mod tag_pool;

pub use arena::{Allocation, Arena, ArenaError, Policy, Source, TagSnapshot, ARENA_NAME_MAX, MAX_TAGS_PER_ALLOCATION};
pub use tag::TagKind;
