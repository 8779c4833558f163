//! Address spaces and huge-block mappings.
//!
//! An [`AddressSpace`] holds its mappings and a block-granular page table
//! behind one lock. Faults, unmapping and forking go through that lock; the
//! fault path drops it around allocation and copying.

use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{
    fmt,
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;
use region_ledger::RegionLedger;
use snafu::{ResultExt as _, Snafu, ensure};
use snafu_utils::Location;
use spin::mutex::{SpinMutex, SpinMutexGuard};

use crate::{
    Align as _,
    block::BlockRef,
    fault::{self, FaultOutcome},
    object::BackingObject,
    reservation::{self, ReserveError},
    source::Pfn,
};

bitflags! {
    /// Access and reservation behavior requested at map time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        /// Blocks are shared through the object's cache instead of being
        /// copied on write.
        const SHARED = 1 << 0;
        const WRITE = 1 << 1;
        /// Nothing is reserved at map time; faults take whatever is free.
        const NORESERVE = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReservationFlags: u32 {
        /// The mapping reserved its whole range privately and owns the
        /// ledger recording which offsets consumed it.
        const OWNER = 1 << 0;
        /// A block of this mapping was taken away so that the reservation
        /// owner could write to it. Faults on the mapping fail.
        const UNMAPPED = 1 << 1;
    }
}

#[derive(Debug, Snafu)]
pub enum MapError {
    #[snafu(display("range {start:#x}+{len:#x} is not aligned to {block_size:#x}"))]
    Misaligned {
        start: usize,
        len: usize,
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("range {start:#x}+{len:#x} overlaps an existing mapping"))]
    Overlap {
        start: usize,
        len: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no mapping starts at {start:#x}"))]
    NotMapped {
        start: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to reserve blocks for the mapping"))]
    Reserve {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: ReserveError,
    },
}

#[derive(Debug, Default)]
pub(crate) struct PrivateReservation {
    /// Offsets whose reservation has been consumed. Present only on the
    /// owner.
    pub(crate) ledger: Option<RegionLedger>,
    pub(crate) flags: ReservationFlags,
}

/// A range of an address space backed by a [`BackingObject`].
///
/// Dropping the last reference gives back the part of a private
/// reservation that was never consumed.
pub struct Mapping {
    space: Weak<AddressSpace>,
    object: Arc<BackingObject>,
    start: usize,
    len: usize,
    offset: usize,
    flags: MappingFlags,
    pub(crate) private: SpinMutex<PrivateReservation>,
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("start", &format_args!("{:#x}", self.start))
            .field("len", &format_args!("{:#x}", self.len))
            .field("offset", &self.offset)
            .field("flags", &self.flags)
            .field("object", &self.object.id())
            .finish_non_exhaustive()
    }
}

impl Mapping {
    #[must_use]
    pub fn object(&self) -> &Arc<BackingObject> {
        &self.object
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    #[must_use]
    pub fn flags(&self) -> MappingFlags {
        self.flags
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.flags.contains(MappingFlags::SHARED)
    }

    #[must_use]
    pub fn reservation_flags(&self) -> ReservationFlags {
        self.private.lock().flags
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.reservation_flags().contains(ReservationFlags::OWNER)
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.object.pool().block_size()
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end()).contains(&addr)
    }

    /// Object offsets covered by the mapping.
    #[must_use]
    pub fn offsets(&self) -> Range<usize> {
        self.offset..self.offset + self.len / self.block_size()
    }

    /// Object offset of the block containing `addr`.
    #[must_use]
    pub fn index_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        self.offset + (addr - self.start) / self.block_size()
    }

    /// Address at which object offset `index` is mapped.
    #[must_use]
    pub fn addr_of(&self, index: usize) -> Option<usize> {
        self.offsets()
            .contains(&index)
            .then(|| self.start + (index - self.offset) * self.block_size())
    }

    pub(crate) fn space(&self) -> Option<Arc<AddressSpace>> {
        self.space.upgrade()
    }

    /// Removes the page-table entries of this mapping for object offsets in
    /// `offsets`.
    pub(crate) fn zap(&self, offsets: Range<usize>) {
        let Some(space) = self.space() else {
            return;
        };
        let first = offsets.start.max(self.offset);
        let last = offsets.end.min(self.offsets().end);
        if first >= last {
            return;
        }
        let (Some(from), Some(to)) = (self.addr_of(first), self.addr_of(last - 1)) else {
            return;
        };
        let removed: Vec<Pte> = {
            let mut state = space.lock();
            let mut tail = state.table.split_off(&from);
            let mut rest = tail.split_off(&(to + 1));
            state.table.append(&mut rest);
            tail.into_values().collect()
        };
        drop(removed);
    }

    /// Removes the entry mapping `block` at object offset `index` and marks
    /// the mapping [`UNMAPPED`](ReservationFlags::UNMAPPED).
    ///
    /// Returns `false` if the entry maps something else.
    pub(crate) fn zap_block(&self, index: usize, block: &BlockRef) -> bool {
        let (Some(space), Some(addr)) = (self.space(), self.addr_of(index)) else {
            return false;
        };
        let removed = {
            let mut state = space.lock();
            let maps_block = state
                .table
                .get(&addr)
                .is_some_and(|pte| pte.block.same_block(block));
            if !maps_block {
                return false;
            }
            self.private.lock().flags |= ReservationFlags::UNMAPPED;
            state.table.remove(&addr)
        };
        drop(removed);
        true
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        reservation::close(self);
    }
}

/// A page-table entry.
#[derive(Debug)]
pub(crate) struct Pte {
    pub(crate) block: BlockRef,
    pub(crate) writable: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SpaceState {
    pub(crate) mappings: Vec<Arc<Mapping>>,
    pub(crate) table: BTreeMap<usize, Pte>,
}

impl SpaceState {
    pub(crate) fn find(&self, addr: usize) -> Option<&Arc<Mapping>> {
        self.mappings.iter().find(|m| m.contains(addr))
    }

    pub(crate) fn holds(&self, mapping: &Arc<Mapping>) -> bool {
        self.mappings.iter().any(|m| Arc::ptr_eq(m, mapping))
    }

    fn overlaps(&self, range: &Range<usize>) -> bool {
        self.mappings
            .iter()
            .any(|m| m.start < range.end && range.start < m.end())
    }
}

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

pub struct AddressSpace {
    id: u64,
    state: SpinMutex<SpaceState>,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            state: SpinMutex::new(SpaceState::default()),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn lock(&self) -> SpinMutexGuard<'_, SpaceState> {
        self.state.lock()
    }

    /// Maps `len` bytes of `object` starting at block `offset` to `start`.
    ///
    /// Unless [`NORESERVE`](MappingFlags::NORESERVE) is given, every block of
    /// the range is reserved before the mapping becomes visible: in the
    /// object's ledger for shared mappings, in a ledger owned by the new
    /// mapping for private ones.
    pub fn map(
        self: &Arc<Self>,
        object: &Arc<BackingObject>,
        start: usize,
        len: usize,
        offset: usize,
        flags: MappingFlags,
    ) -> Result<Arc<Mapping>, MapError> {
        let block_size = object.pool().block_size();
        ensure!(
            len > 0
                && start.is_aligned(block_size)
                && len.is_aligned(block_size)
                && start.checked_add(len).is_some(),
            MisalignedSnafu {
                start,
                len,
                block_size
            }
        );
        let range = start..start + len;
        ensure!(
            !self.lock().overlaps(&range),
            OverlapSnafu { start, len }
        );

        let mapping = Arc::new(Mapping {
            space: Arc::downgrade(self),
            object: Arc::clone(object),
            start,
            len,
            offset,
            flags,
            private: SpinMutex::new(PrivateReservation::default()),
        });
        reservation::reserve(object, mapping.offsets(), Some(&mapping)).context(ReserveSnafu)?;

        {
            let mut state = self.lock();
            if state.overlaps(&range) {
                drop(state);
                return OverlapSnafu { start, len }.fail();
            }
            state.mappings.push(Arc::clone(&mapping));
        }
        object.register(&mapping);
        trace!(
            "space {} mapped {start:#x}+{len:#x} of object {} at offset {offset}, {flags:?}",
            self.id,
            object.id()
        );
        Ok(mapping)
    }

    /// Removes the mapping starting at `start` together with its page-table
    /// entries.
    pub fn unmap(&self, start: usize) -> Result<(), MapError> {
        let (mapping, ptes) = {
            let mut state = self.lock();
            let Some(pos) = state.mappings.iter().position(|m| m.start == start) else {
                return NotMappedSnafu { start }.fail();
            };
            let mapping = state.mappings.swap_remove(pos);
            let mut tail = state.table.split_off(&mapping.start);
            let mut rest = tail.split_off(&mapping.end());
            state.table.append(&mut rest);
            (mapping, tail)
        };
        trace!("space {} unmapped {start:#x}", self.id);
        drop(ptes);
        drop(mapping);
        Ok(())
    }

    /// Duplicates the address space.
    ///
    /// Shared mappings see the same blocks in both spaces. Private blocks are
    /// shared read-only so that the first write on either side copies them.
    /// The child never inherits ownership of a private reservation.
    #[must_use]
    pub fn fork(self: &Arc<Self>) -> Arc<Self> {
        let child = Self::new();
        let mut registered = Vec::new();
        {
            let mut parent = self.lock();
            let mut state = child.lock();
            let SpaceState { mappings, table } = &mut *parent;
            for mapping in mappings.iter() {
                let copy = Arc::new(Mapping {
                    space: Arc::downgrade(&child),
                    object: Arc::clone(&mapping.object),
                    start: mapping.start,
                    len: mapping.len,
                    offset: mapping.offset,
                    flags: mapping.flags,
                    private: SpinMutex::new(PrivateReservation::default()),
                });
                let shared = mapping.is_shared();
                for (&addr, pte) in table.range_mut(mapping.start..mapping.end()) {
                    if !shared {
                        pte.writable = false;
                    }
                    state.table.insert(
                        addr,
                        Pte {
                            block: pte.block.clone(),
                            writable: pte.writable,
                        },
                    );
                }
                state.mappings.push(Arc::clone(&copy));
                registered.push(copy);
            }
        }
        for mapping in &registered {
            mapping.object.register(mapping);
        }
        debug!("space {} forked into space {}", self.id, child.id);
        child
    }

    /// Resolves an access to `addr`.
    pub fn fault(self: &Arc<Self>, addr: usize, is_write: bool) -> FaultOutcome {
        fault::handle_fault(self, addr, is_write)
    }

    /// Returns the frame mapped at `addr` and whether it is writable.
    #[must_use]
    pub fn translate(&self, addr: usize) -> Option<(Pfn, bool)> {
        let state = self.lock();
        let mapping = state.find(addr)?;
        let haddr = addr.align_down(mapping.block_size());
        state
            .table
            .get(&haddr)
            .map(|pte| (pte.block.pfn(), pte.writable))
    }

    /// Returns the block mapped at `addr`.
    #[must_use]
    pub fn block_at(&self, addr: usize) -> Option<BlockRef> {
        let state = self.lock();
        let mapping = state.find(addr)?;
        let haddr = addr.align_down(mapping.block_size());
        state.table.get(&haddr).map(|pte| pte.block.clone())
    }

    #[must_use]
    pub fn mapping_at(&self, addr: usize) -> Option<Arc<Mapping>> {
        self.lock().find(addr).cloned()
    }

    /// Number of installed page-table entries.
    #[must_use]
    pub fn resident(&self) -> usize {
        self.lock().table.len()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.table.clear();
        state.mappings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::NodeMask,
        pool::PoolClass,
        source::{BlockSource, NeverAbort},
        testing::MemorySource,
    };

    const BLOCK: usize = 2 << 20;

    fn pool(blocks: usize) -> Arc<PoolClass> {
        let source: Arc<dyn BlockSource> = Arc::new(MemorySource::new(&[16]));
        let pool = PoolClass::new(9, NodeMask::first_n(1), source);
        pool.set_target(blocks, pool.nodes(), &NeverAbort);
        pool
    }

    #[test]
    fn test_map_checks_range() {
        let pool = pool(4);
        let object = BackingObject::anonymous(&pool, 4);
        let space = AddressSpace::new();
        let flags = MappingFlags::SHARED | MappingFlags::WRITE;

        assert!(matches!(
            space.map(&object, BLOCK + 4096, BLOCK, 0, flags),
            Err(MapError::Misaligned { .. })
        ));
        assert!(matches!(
            space.map(&object, BLOCK, 0, 0, flags),
            Err(MapError::Misaligned { .. })
        ));
        let mapping = space.map(&object, BLOCK, 2 * BLOCK, 0, flags).unwrap();
        assert_eq!(mapping.offsets(), 0..2);
        assert_eq!(mapping.addr_of(1), Some(2 * BLOCK));
        assert_eq!(mapping.addr_of(2), None);
        assert!(matches!(
            space.map(&object, 2 * BLOCK, BLOCK, 2, flags),
            Err(MapError::Overlap { .. })
        ));
        assert!(matches!(
            space.unmap(2 * BLOCK),
            Err(MapError::NotMapped { .. })
        ));
    }

    #[test]
    fn test_shared_map_reserves_in_object() {
        let pool = pool(4);
        let object = BackingObject::anonymous(&pool, 4);
        let space = AddressSpace::new();
        let flags = MappingFlags::SHARED | MappingFlags::WRITE;

        let mapping = space.map(&object, 0, 2 * BLOCK, 1, flags).unwrap();
        assert!(!mapping.is_owner());
        assert_eq!(object.reserved_regions(), [1..3]);
        assert_eq!(pool.stats().reserved, 2);

        drop(mapping);
        space.unmap(0).unwrap();
        assert_eq!(pool.stats().reserved, 2);
        drop(object);
        assert_eq!(pool.stats().reserved, 0);
    }

    #[test]
    fn test_private_map_owns_reservation() {
        let pool = pool(4);
        let object = BackingObject::anonymous(&pool, 4);
        let space = AddressSpace::new();

        let mapping = space
            .map(&object, 0, 3 * BLOCK, 0, MappingFlags::WRITE)
            .unwrap();
        assert!(mapping.is_owner());
        assert!(object.reserved_regions().is_empty());
        assert_eq!(pool.stats().reserved, 3);

        drop(mapping);
        space.unmap(0).unwrap();
        assert_eq!(pool.stats().reserved, 0);
    }

    #[test]
    fn test_noreserve_map_reserves_nothing() {
        let pool = pool(1);
        let object = BackingObject::anonymous(&pool, 4);
        let space = AddressSpace::new();
        let mapping = space
            .map(
                &object,
                0,
                4 * BLOCK,
                0,
                MappingFlags::WRITE | MappingFlags::NORESERVE,
            )
            .unwrap();
        assert!(!mapping.is_owner());
        assert_eq!(pool.stats().reserved, 0);
    }

    #[test]
    fn test_map_fails_without_capacity() {
        let pool = pool(2);
        let object = BackingObject::anonymous(&pool, 4);
        let space = AddressSpace::new();
        let err = space
            .map(&object, 0, 3 * BLOCK, 0, MappingFlags::WRITE)
            .unwrap_err();
        assert!(matches!(
            err,
            MapError::Reserve {
                source: ReserveError::NoMemory { .. },
                ..
            }
        ));
        assert_eq!(pool.stats().reserved, 0);
        assert!(space.mapping_at(0).is_none());
    }

    #[test]
    fn test_fork_copies_mappings_without_ownership() {
        let pool = pool(4);
        let object = BackingObject::anonymous(&pool, 4);
        let parent = AddressSpace::new();
        let mapping = parent
            .map(&object, 0, 2 * BLOCK, 0, MappingFlags::WRITE)
            .unwrap();
        assert!(parent.fault(0, true).is_installed());
        assert_eq!(parent.translate(0).map(|(_, w)| w), Some(true));

        let child = parent.fork();
        let child_mapping = child.mapping_at(0).unwrap();
        assert!(mapping.is_owner());
        assert!(!child_mapping.is_owner());
        assert_eq!(parent.translate(0).map(|(_, w)| w), Some(false));
        assert_eq!(child.translate(0), parent.translate(0));
        assert_eq!(parent.block_at(0).unwrap().ref_count(), 3);
        assert_eq!(pool.stats().reserved, 1);
    }
}
