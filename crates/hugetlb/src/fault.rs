//! Fault and copy-on-write handling.
//!
//! A fault on an unpopulated address finds the block in the object's cache
//! or allocates one: shared mappings publish new blocks in the cache,
//! private mappings keep them anonymous. A write to a read-only private
//! entry either takes over the block, if nothing else references it, or
//! copies it.
//!
//! Faults on the same object offset are serialized by an instantiation lock,
//! so that two first touches cannot both allocate. The address-space lock is
//! dropped around allocation and copying and the entry re-validated after
//! taking it again.

use alloc::sync::Arc;
use core::hash::{Hash as _, Hasher};

use snafu_utils::Report;
use spin::mutex::{SpinMutex, SpinMutexGuard};

use crate::{
    Align as _,
    block::BlockRef,
    engine::{self, AllocError},
    mm::{AddressSpace, Mapping, MappingFlags, Pte, ReservationFlags, SpaceState},
    reservation,
};

const FAULT_LOCKS: usize = 64;

static INSTANTIATION_LOCKS: [SpinMutex<()>; FAULT_LOCKS] = [const { SpinMutex::new(()) }; FAULT_LOCKS];

/// FNV-1a, enough to spread (object, offset) pairs over the lock table.
struct FnvHasher(u64);

impl Default for FnvHasher {
    fn default() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
    }
}

fn instantiation_lock(object: u64, index: usize) -> &'static SpinMutex<()> {
    let mut hasher = FnvHasher::default();
    object.hash(&mut hasher);
    index.hash(&mut hasher);
    #[expect(clippy::cast_possible_truncation)]
    let slot = (hasher.finish() % FAULT_LOCKS as u64) as usize;
    &INSTANTIATION_LOCKS[slot]
}

/// Result of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum FaultOutcome {
    /// A block was mapped where nothing was mapped before.
    Installed,
    /// A shared block was replaced by a private copy.
    Copied,
    /// A read-only private block was made writable without copying.
    Reused,
    /// Someone else resolved the fault first.
    AlreadyPresent,
    /// The access is beyond the object, the quota is exhausted or the
    /// mapping lost its block to the reservation owner.
    Sigbus,
    /// No block could be allocated.
    Oom,
    /// No mapping covers the address or it does not permit the access.
    Sigsegv,
}

/// Resolves an access to `addr` of `space`.
pub fn handle_fault(space: &Arc<AddressSpace>, addr: usize, is_write: bool) -> FaultOutcome {
    let Some(mapping) = space.mapping_at(addr) else {
        return FaultOutcome::Sigsegv;
    };
    if is_write && !mapping.flags().contains(MappingFlags::WRITE) {
        return FaultOutcome::Sigsegv;
    }
    let object = Arc::clone(mapping.object());
    let haddr = addr.align_down(mapping.block_size());
    let index = mapping.index_of(haddr);

    let _fault_guard = object.fault_guard();
    let _instantiation = instantiation_lock(object.id(), index).lock();

    let state = space.lock();
    let (present, writable) = match state.table.get(&haddr) {
        Some(pte) => (true, pte.writable),
        None => (false, false),
    };
    if !present {
        drop(state);
        return no_page(space, &mapping, haddr, index, is_write);
    }
    if is_write && !writable {
        return write_protected(space, state, &mapping, haddr, index);
    }
    FaultOutcome::AlreadyPresent
}

fn alloc_failed(space: &AddressSpace, haddr: usize, err: &AllocError) -> FaultOutcome {
    match err {
        AllocError::NoSpace { .. } => {
            debug!(
                "space {} fault at {haddr:#x}: {}",
                space.id(),
                Report::new(err)
            );
            FaultOutcome::Sigbus
        }
        AllocError::NoMemory { .. } => {
            error!(
                "space {} fault at {haddr:#x}: {}",
                space.id(),
                Report::new(err)
            );
            FaultOutcome::Oom
        }
    }
}

fn no_page(
    space: &Arc<AddressSpace>,
    mapping: &Arc<Mapping>,
    haddr: usize,
    index: usize,
    is_write: bool,
) -> FaultOutcome {
    if mapping
        .reservation_flags()
        .contains(ReservationFlags::UNMAPPED)
    {
        warn!(
            "space {} fault at {haddr:#x}: block was taken by the reservation owner",
            space.id()
        );
        return FaultOutcome::Sigbus;
    }
    let object = mapping.object();
    let shared = mapping.is_shared();

    let (block, new_anon) = if let Some(block) = object.cached(index) {
        (block, false)
    } else {
        if index >= object.size() {
            return FaultOutcome::Sigbus;
        }
        let block = match engine::alloc(mapping, haddr, false) {
            Ok(block) => block,
            Err(err) => {
                if space.lock().table.contains_key(&haddr) {
                    return FaultOutcome::AlreadyPresent;
                }
                return alloc_failed(space, haddr, &err);
            }
        };
        object.pool().source().clear(block.pfn(), object.pool().order());
        if shared {
            block.clear_restore_reserve();
            object.insert_cached(index, block.clone());
        } else {
            block.set_anon();
        }
        (block, !shared)
    };

    let mut state = space.lock();
    if !state.holds(mapping) || state.table.contains_key(&haddr) {
        let outcome = if state.holds(mapping) {
            FaultOutcome::AlreadyPresent
        } else {
            FaultOutcome::Sigsegv
        };
        drop(state);
        if new_anon {
            reservation::restore_on_error(mapping, index, &block);
        }
        return outcome;
    }
    if new_anon {
        block.clear_restore_reserve();
    }
    let writable = shared && mapping.flags().contains(MappingFlags::WRITE);
    state.table.insert(haddr, Pte { block, writable });
    trace!("space {} installed block at {haddr:#x}", space.id());

    if is_write && !shared {
        return match write_protected(space, state, mapping, haddr, index) {
            FaultOutcome::Reused => FaultOutcome::Installed,
            outcome => outcome,
        };
    }
    FaultOutcome::Installed
}

/// Handles a write to a read-only entry. Called with the address-space lock
/// held; returns with it released.
fn write_protected<'a>(
    space: &'a Arc<AddressSpace>,
    mut state: SpinMutexGuard<'a, SpaceState>,
    mapping: &Arc<Mapping>,
    haddr: usize,
    index: usize,
) -> FaultOutcome {
    let object = mapping.object();
    loop {
        let Some(pte) = state.table.get_mut(&haddr) else {
            return FaultOutcome::AlreadyPresent;
        };
        if pte.writable {
            return FaultOutcome::AlreadyPresent;
        }
        if mapping.is_shared() || (pte.block.ref_count() == 1 && pte.block.is_anon()) {
            pte.writable = true;
            return FaultOutcome::Reused;
        }

        // An owner copying a block it did not get from the cache already
        // consumed its reservation for the offset.
        let outside_reserve = mapping.is_owner() && !object.is_cached(index, &pte.block);
        let old = pte.block.clone();
        drop(state);

        let new = match engine::alloc(mapping, haddr, outside_reserve) {
            Ok(new) => new,
            Err(err) if outside_reserve => {
                warn!(
                    "space {} copy at {haddr:#x} failed ({}), unmapping the block from other mappings",
                    space.id(),
                    Report::new(&err)
                );
                unmap_ref_private(mapping, index, &old);
                state = space.lock();
                let unchanged = state
                    .table
                    .get(&haddr)
                    .is_some_and(|pte| pte.block.same_block(&old) && !pte.writable);
                drop(old);
                if unchanged {
                    continue;
                }
                return FaultOutcome::AlreadyPresent;
            }
            Err(err) => return alloc_failed(space, haddr, &err),
        };

        let pool = object.pool();
        pool.source().copy(new.pfn(), old.pfn(), pool.order());

        state = space.lock();
        let unchanged = state.holds(mapping)
            && state
                .table
                .get(&haddr)
                .is_some_and(|pte| pte.block.same_block(&old) && !pte.writable);
        if !unchanged {
            drop(state);
            reservation::restore_on_error(mapping, index, &new);
            return FaultOutcome::AlreadyPresent;
        }
        new.clear_restore_reserve();
        new.set_anon();
        let replaced = state.table.insert(
            haddr,
            Pte {
                block: new,
                writable: true,
            },
        );
        drop(state);
        drop(replaced);
        trace!("space {} copied block at {haddr:#x}", space.id());
        return FaultOutcome::Copied;
    }
}

/// Takes `block` away from every private mapping of the object that does not
/// own a reservation, so that the owner can write to it in place.
fn unmap_ref_private(owner: &Arc<Mapping>, index: usize, block: &BlockRef) {
    for mapping in owner.object().mappings() {
        if Arc::ptr_eq(&mapping, owner) || mapping.is_shared() || mapping.is_owner() {
            continue;
        }
        mapping.zap_block(index, block);
    }
}
