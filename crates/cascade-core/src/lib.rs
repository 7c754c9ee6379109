//! Core types and synchronization primitives for the CascadeOS kernel.
//!
//! This crate holds the host-testable substrate the rest of the kernel is
//! built on: address types, CPU identifiers, the arch-abstraction trait,
//! CPU exclusion tokens, the ticket spinlock, intrusive list primitives,
//! per-CPU storage, and the logging macros used everywhere else.
//!
//! Living outside the kernel target lets all of it run under `cargo test`
//! on the host.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod arch;
pub mod cpu_local;
pub mod exclusion;
pub mod frame;
pub mod id;
pub mod list;
pub mod lock;
pub mod log;
pub mod safety;
pub mod static_assert;
