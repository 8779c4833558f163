//! Reservation accounting.
//!
//! A reservation promises that a later fault on an offset finds a block.
//! Shared mappings record reserved offsets in their object's ledger; a
//! private mapping reserves its whole range at map time and records in its
//! own ledger which offsets have consumed the reservation. Each reserved
//! offset is charged once to the object's quota and once to the class's
//! reserved count.
//!
//! Allocation checks and records reservations in two steps:
//! [`needs_reservation`] computes the charge without touching any ledger and
//! returns a [`PendingReservation`], which the caller commits once it holds a
//! block or aborts otherwise.

use core::ops::Range;

use region_ledger::RegionLedger;
use snafu::{ResultExt as _, Snafu};
use snafu_utils::Location;

use crate::{
    block::BlockRef,
    mm::{Mapping, MappingFlags, ReservationFlags},
    object::BackingObject,
    pool::PoolError,
    subpool::{self, SubpoolError},
};

#[derive(Debug, Snafu)]
pub enum ReserveError {
    #[snafu(display("quota exhausted"))]
    NoSpace {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: SubpoolError,
    },
    #[snafu(display("not enough blocks"))]
    NoMemory {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: PoolError,
    },
}

/// Which ledger, if any, tracks the reservations of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracking {
    /// The object's ledger; an entry means "reserved".
    Shared,
    /// The mapping's own ledger; an entry means "consumed".
    Owner,
    /// Nothing is tracked, every block is charged.
    Untracked,
}

fn tracking(mapping: &Mapping) -> Tracking {
    if mapping.is_shared() {
        Tracking::Shared
    } else if mapping.is_owner() {
        Tracking::Owner
    } else {
        Tracking::Untracked
    }
}

/// A reservation charge that has been computed but not recorded.
#[must_use = "a pending reservation must be committed or aborted"]
#[derive(Debug)]
pub struct PendingReservation<'m> {
    mapping: &'m Mapping,
    index: usize,
    charge: usize,
}

impl PendingReservation<'_> {
    /// Blocks that must be charged because no reservation covers the offset.
    #[must_use]
    pub fn charge(&self) -> usize {
        self.charge
    }

    /// Records that the offset now has a block.
    ///
    /// Returns the charge as of now, which is smaller than
    /// [`charge`](Self::charge) if a reservation for the offset was made in
    /// the meantime.
    pub fn commit(self) -> usize {
        let offsets = self.index..self.index + 1;
        match tracking(self.mapping) {
            Tracking::Shared => self.mapping.object().ledger.lock().add(offsets),
            Tracking::Owner => {
                let mut private = self.mapping.private.lock();
                let added = private.ledger.as_mut().map_or(0, |l| l.add(offsets));
                usize::from(added == 0)
            }
            Tracking::Untracked => 1,
        }
    }

    /// Drops the charge without recording anything.
    pub fn abort(self) {}
}

/// Computes how many blocks a fault at object offset `index` must charge.
pub fn needs_reservation(mapping: &Mapping, index: usize) -> PendingReservation<'_> {
    let offsets = index..index + 1;
    let charge = match tracking(mapping) {
        Tracking::Shared => mapping.object().ledger.lock().chg(offsets),
        Tracking::Owner => {
            let private = mapping.private.lock();
            let unconsumed = private.ledger.as_ref().map_or(0, |l| l.chg(offsets));
            usize::from(unconsumed == 0)
        }
        Tracking::Untracked => 1,
    };
    PendingReservation {
        mapping,
        index,
        charge,
    }
}

/// Reserves `offsets` of `object` for a new mapping.
///
/// With `mapping` absent or shared, the offsets not yet reserved are added
/// to the object's ledger. A private mapping reserves the whole range and
/// becomes the owner of a fresh ledger. Nothing is reserved for
/// [`NORESERVE`](MappingFlags::NORESERVE) mappings.
///
/// Returns the number of blocks newly reserved. On failure nothing is
/// charged.
pub fn reserve(
    object: &BackingObject,
    offsets: Range<usize>,
    mapping: Option<&Mapping>,
) -> Result<usize, ReserveError> {
    let flags = mapping.map_or(MappingFlags::SHARED, Mapping::flags);
    if flags.contains(MappingFlags::NORESERVE) {
        return Ok(0);
    }
    let shared = flags.contains(MappingFlags::SHARED);
    let chg = if shared {
        object.ledger.lock().chg(offsets.clone())
    } else {
        offsets.len()
    };

    let sp = object.quota();
    let global = subpool::get_blocks(sp, chg).context(NoSpaceSnafu)?;
    if let Err(err) = object.pool().gather_surplus(global) {
        subpool::cancel_blocks(sp, chg, global);
        return Err(err).context(NoMemorySnafu);
    }

    if !shared {
        if let Some(mapping) = mapping {
            let mut private = mapping.private.lock();
            private.ledger = Some(RegionLedger::new());
            private.flags |= ReservationFlags::OWNER;
        }
        return Ok(chg);
    }

    let added = object.ledger.lock().add(offsets.clone());
    if chg > added {
        // Part of the range was reserved concurrently.
        let refund = subpool::put_blocks(sp, chg - added);
        object.pool().return_unused_surplus(refund);
    }
    trace!(
        "object {} reserved {added} blocks in {offsets:?}",
        object.id()
    );
    Ok(added)
}

/// Gives back the reservations of `object` from `offset` on, of which
/// `freed` belonged to blocks just dropped from the cache.
pub fn unreserve(object: &BackingObject, offset: usize, freed: usize) {
    let chg = object.ledger.lock().truncate(offset);
    release_reserved(object, chg, freed);
}

/// Gives back the reservations of `object` in `offsets`, of which `freed`
/// belonged to blocks just dropped from the cache.
pub fn punch_hole(object: &BackingObject, offsets: Range<usize>, freed: usize) {
    let chg = object.ledger.lock().remove(offsets);
    release_reserved(object, chg, freed);
}

fn release_reserved(object: &BackingObject, chg: usize, freed: usize) {
    assert!(
        chg >= freed,
        "object {} freed {freed} blocks but only {chg} were tracked",
        object.id()
    );
    let global = subpool::put_blocks(object.quota(), chg - freed);
    object.pool().return_unused_surplus(global);
}

/// Gives back the part of a private reservation the mapping never consumed.
pub(crate) fn close(mapping: &Mapping) {
    let offsets = mapping.offsets();
    let unused = {
        let mut private = mapping.private.lock();
        let Some(ledger) = private.ledger.take() else {
            return;
        };
        private.flags.remove(ReservationFlags::OWNER);
        offsets.len() - ledger.count(offsets)
    };
    if unused == 0 {
        return;
    }
    let object = mapping.object();
    let global = subpool::put_blocks(object.quota(), unused);
    object.pool().return_unused_surplus(global);
    trace!(
        "mapping at {:#x} closed, {unused} unused reserved blocks returned",
        mapping.start()
    );
}

/// Repairs the ledger after a freshly allocated `block` for `index` turned
/// out not to be needed, so that releasing the block leaves the reservation
/// state as it was before the allocation.
pub(crate) fn restore_on_error(mapping: &Mapping, index: usize, block: &BlockRef) {
    let pending = needs_reservation(mapping, index);
    let needs = pending.charge() > 0;
    let offsets = index..index + 1;
    match (block.restores_reserve(), needs) {
        // The block consumed a reservation that the ledger no longer shows.
        (true, true) => match tracking(mapping) {
            Tracking::Shared => {
                mapping.object().ledger.lock().add(offsets);
            }
            Tracking::Owner => {
                if let Some(ledger) = mapping.private.lock().ledger.as_mut() {
                    ledger.remove(offsets);
                }
            }
            Tracking::Untracked => {}
        },
        // The ledger shows a reservation the block did not consume.
        (false, false) => match tracking(mapping) {
            Tracking::Shared => {
                mapping.object().ledger.lock().remove(offsets);
            }
            Tracking::Owner => {
                if let Some(ledger) = mapping.private.lock().ledger.as_mut() {
                    ledger.add(offsets);
                }
            }
            Tracking::Untracked => {}
        },
        _ => {}
    }
    pending.abort();
}
