//! Kernel-independent building blocks for the Argentum kernel.
//!
//! Everything in this crate is plain data-structure code: no locks, no
//! interrupts, no allocation. The kernel wraps these types in its own
//! synchronization (a `SpinLock` around a `SlotCache`, a run-queue lock
//! around an `IndexQueue`), which keeps this crate testable on the host.

#![cfg_attr(not(test), no_std)]

pub mod cache;
pub mod queue;
