//! Backing objects of shared mappings.
//!
//! A [`BackingObject`] stands for a file in a huge-page filesystem: it has a
//! size in blocks, a reservation ledger shared by every mapping of it, an
//! optional quota and a cache of instantiated blocks by offset.

use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{
    fmt,
    ops::Range,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use region_ledger::RegionLedger;
use spin::{RwLock, RwLockReadGuard, mutex::SpinMutex};

use crate::{
    block::BlockRef,
    config::SubpoolConfig,
    mm::Mapping,
    pool::PoolClass,
    reservation,
    subpool::{Subpool, SubpoolError},
};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

pub struct BackingObject {
    id: u64,
    pool: Arc<PoolClass>,
    subpool: Option<Arc<Subpool>>,
    /// Offsets with a reservation or an instantiated block.
    pub(crate) ledger: SpinMutex<RegionLedger>,
    cache: SpinMutex<BTreeMap<usize, BlockRef>>,
    size: AtomicUsize,
    mappings: SpinMutex<Vec<Weak<Mapping>>>,
    /// Held shared by faults and exclusively by truncation and hole
    /// punching, so cache and ledger change together.
    fault_lock: RwLock<()>,
}

impl fmt::Debug for BackingObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingObject")
            .field("id", &self.id)
            .field("order", &self.pool.order())
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

impl BackingObject {
    /// Creates an object of `size` blocks drawing from `pool`.
    ///
    /// A subpool is set up unless `quota` is unlimited; its minimum is
    /// reserved right away.
    pub fn new(
        pool: &Arc<PoolClass>,
        size: usize,
        quota: &SubpoolConfig,
    ) -> Result<Arc<Self>, SubpoolError> {
        let subpool = if quota.is_unlimited() {
            None
        } else {
            Some(Subpool::new(Arc::clone(pool), quota)?)
        };
        Ok(Arc::new(Self::with_subpool(pool, size, subpool)))
    }

    /// Creates an object without quota, as backs anonymous mappings.
    #[must_use]
    pub fn anonymous(pool: &Arc<PoolClass>, size: usize) -> Arc<Self> {
        Arc::new(Self::with_subpool(pool, size, None))
    }

    fn with_subpool(pool: &Arc<PoolClass>, size: usize, subpool: Option<Arc<Subpool>>) -> Self {
        Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            pool: Arc::clone(pool),
            subpool,
            ledger: SpinMutex::new(RegionLedger::new()),
            cache: SpinMutex::new(BTreeMap::new()),
            size: AtomicUsize::new(size),
            mappings: SpinMutex::new(Vec::new()),
            fault_lock: RwLock::new(()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PoolClass> {
        &self.pool
    }

    #[must_use]
    pub fn subpool(&self) -> Option<&Arc<Subpool>> {
        self.subpool.as_ref()
    }

    pub(crate) fn quota(&self) -> Option<&Subpool> {
        self.subpool.as_deref()
    }

    /// Size in blocks.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Snapshot of the reserved or instantiated offsets.
    #[must_use]
    pub fn reserved_regions(&self) -> Vec<Range<usize>> {
        self.ledger.lock().as_slice().to_vec()
    }

    /// Returns the cached block at `index`.
    #[must_use]
    pub fn cached(&self, index: usize) -> Option<BlockRef> {
        self.cache.lock().get(&index).cloned()
    }

    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }

    pub(crate) fn is_cached(&self, index: usize, block: &BlockRef) -> bool {
        self.cache
            .lock()
            .get(&index)
            .is_some_and(|cached| cached.same_block(block))
    }

    /// Caches a freshly instantiated block.
    ///
    /// # Panics
    ///
    /// Panics if a block is already cached at `index`; callers hold the
    /// instantiation lock of the offset.
    pub(crate) fn insert_cached(&self, index: usize, block: BlockRef) {
        let old = self.cache.lock().insert(index, block);
        assert!(old.is_none(), "object {} offset {index} cached twice", self.id);
    }

    pub(crate) fn fault_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.fault_lock.read()
    }

    pub(crate) fn register(&self, mapping: &Arc<Mapping>) {
        let mut mappings = self.mappings.lock();
        mappings.retain(|m| m.strong_count() > 0);
        mappings.push(Arc::downgrade(mapping));
    }

    /// Live mappings of the object, collected so that no object lock is held
    /// while they are visited.
    pub(crate) fn mappings(&self) -> Vec<Arc<Mapping>> {
        self.mappings
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Sets the size to `size` blocks.
    ///
    /// Shrinking unmaps the blocks past the new end from every mapping,
    /// drops them from the cache and gives back their reservations.
    pub fn truncate(&self, size: usize) {
        let _guard = self.fault_lock.write();
        let old_size = self.size.swap(size, Ordering::AcqRel);
        if size > old_size {
            return;
        }
        for mapping in self.mappings() {
            mapping.zap(size..usize::MAX);
        }
        let removed = self.cache.lock().split_off(&size);
        let freed = removed.len();
        drop(removed);
        reservation::unreserve(self, size, freed);
        debug!(
            "object {} truncated from {old_size} to {size} blocks, {freed} blocks freed",
            self.id
        );
    }

    /// Unmaps and uncaches the blocks in `range` and gives back their
    /// reservations. The size is unchanged.
    pub fn punch_hole(&self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let _guard = self.fault_lock.write();
        for mapping in self.mappings() {
            mapping.zap(range.clone());
        }
        let removed: Vec<_> = {
            let mut cache = self.cache.lock();
            let mut tail = cache.split_off(&range.start);
            let mut rest = tail.split_off(&range.end);
            cache.append(&mut rest);
            tail.into_values().collect()
        };
        let freed = removed.len();
        drop(removed);
        reservation::punch_hole(self, range.clone(), freed);
        debug!(
            "object {} hole {range:?} punched, {freed} blocks freed",
            self.id
        );
    }
}

impl Drop for BackingObject {
    fn drop(&mut self) {
        self.truncate(0);
        if let Some(subpool) = &self.subpool {
            subpool.release();
        }
    }
}
