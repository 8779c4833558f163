//! Huge-page pools, reservations and fault handling.
//!
//! This crate manages pools of large, fixed-size physical blocks ("huge
//! pages"), hands them out to address-space mappings on demand and
//! pre-commits capacity at map time so that a later fault on a reserved
//! offset cannot run out of memory.
//!
//! # Layout
//!
//! - [`pool`]: one [`PoolClass`](pool::PoolClass) per block order, with
//!   global and per-node counters, per-node free lists and the resize,
//!   surplus and overcommit machinery.
//! - [`registry`]: the set of configured classes.
//! - [`subpool`]: per-object quota with an optional pre-reserved minimum.
//! - [`reservation`]: the two-phase "needs, then commit" protocol and the
//!   map/unmap/truncate hooks that charge and refund reservations.
//! - [`engine`]: turns a reservation decision into an in-use block.
//! - [`fault`]: the fault and copy-on-write state machine.
//! - [`object`] and [`mm`]: the backing objects and address spaces the
//!   engine works for.
//!
//! Raw memory comes from an external [`BlockSource`](source::BlockSource).
//!
//! # Locking
//!
//! All counters, free lists and node cursors of a class live behind a single
//! coarse lock. Huge-block operations are rare compared to ordinary page
//! faults, so one lock per class is the intended scalability bound. Lock
//! order is: object fault lock, fault instantiation lock, address-space
//! lock, ledger lock, subpool lock, pool lock. Calls into the block source
//! are made with the pool lock dropped.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod block;
pub mod config;
pub mod engine;
pub mod fault;
pub mod mm;
pub mod node;
pub mod object;
pub mod pool;
pub mod registry;
pub mod reservation;
pub mod source;
pub mod stats;
pub mod subpool;

#[cfg(test)]
mod testing;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

pub trait Align: Sized {
    fn align_down(&self, align: usize) -> Self;
    fn is_aligned(&self, align: usize) -> bool;
}

impl Align for usize {
    fn align_down(&self, align: usize) -> Self {
        self / align * align
    }

    fn is_aligned(&self, align: usize) -> bool {
        self % align == 0
    }
}
