//! Block allocation for faults.

use snafu::{ResultExt as _, Snafu};
use snafu_utils::Location;

use crate::{
    block::BlockRef,
    mm::{Mapping, MappingFlags},
    reservation,
    subpool::{self, SubpoolError},
};

#[derive(Debug, Snafu)]
pub enum AllocError {
    #[snafu(display("quota exhausted"))]
    NoSpace {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: SubpoolError,
    },
    #[snafu(display("no order {order} block available"))]
    NoMemory {
        order: u32,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Returns `true` if a fault with global charge `chg` may consume a
/// reservation.
fn has_reserves(mapping: &Mapping, chg: usize) -> bool {
    let flags = mapping.flags();
    if flags.contains(MappingFlags::NORESERVE) {
        return flags.contains(MappingFlags::SHARED) && chg == 0;
    }
    if flags.contains(MappingFlags::SHARED) || mapping.is_owner() {
        return chg == 0;
    }
    false
}

/// Allocates a block for the fault at `addr` of `mapping`.
///
/// A block covered by a reservation is taken from the reserved stock and
/// the reservation is recorded as consumed. Otherwise the block is charged
/// to the object's quota and taken from the unreserved free blocks or, when
/// none is left, allocated as a surplus block within the overcommit ceiling.
///
/// With `avoid_reserve` the reserved stock is left alone and the mapping's
/// reservation state is not touched; copy-on-write uses this on behalf of a
/// reservation owner whose reservation for the offset is already consumed.
///
/// On failure every counter is left as it was.
pub fn alloc(mapping: &Mapping, addr: usize, avoid_reserve: bool) -> Result<BlockRef, AllocError> {
    let object = mapping.object();
    let pool = object.pool();
    let quota = object.quota();
    let index = mapping.index_of(addr);

    let pending = reservation::needs_reservation(mapping, index);
    let map_chg = pending.charge();
    let charge_quota = map_chg > 0 || avoid_reserve;
    let mut quota_chg = 0;
    let mut gbl_chg = map_chg;
    if charge_quota {
        quota_chg = match subpool::get_blocks(quota, 1) {
            Ok(chg) => chg,
            Err(err) => {
                pending.abort();
                return Err(err).context(NoSpaceSnafu);
            }
        };
        gbl_chg = if avoid_reserve { 1 } else { quota_chg };
    }

    let use_reserve = !avoid_reserve && has_reserves(mapping, gbl_chg);
    let block = pool.dequeue(None, use_reserve).or_else(|| {
        debug_assert!(!use_reserve, "reserved block not found");
        pool.alloc_surplus(None)
    });
    let Some(block) = block else {
        if charge_quota {
            subpool::cancel_blocks(quota, 1, quota_chg);
        }
        pending.abort();
        return NoMemorySnafu {
            order: pool.order(),
        }
        .fail();
    };
    block.set_subpool(object.subpool().cloned());

    if avoid_reserve {
        pending.abort();
    } else {
        let map_commit = pending.commit();
        if map_chg > map_commit {
            // A reservation for the offset appeared after the charge was
            // computed, so the quota was charged twice.
            let refund = subpool::put_blocks(quota, 1);
            pool.return_unused_surplus(refund);
        }
    }
    trace!(
        "allocated block {} for object {} offset {index}, reserve={use_reserve}",
        block.id(),
        object.id()
    );
    Ok(block)
}
