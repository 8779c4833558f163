//! Block storage and reference-counted block handles.
//!
//! Every node of a class owns an [`Arena`] of slots. A slot is vacant, free
//! (linked into the node's free list by index), or in use. Free and vacant
//! slots are chained through their `next` index, so enqueue and dequeue are
//! O(1) and no raw links are involved.

use alloc::{sync::Arc, vec::Vec};
use core::{fmt, mem};

use crate::{node::NodeId, pool::PoolClass, source::Pfn, subpool::Subpool};

/// Location of a block inside its class: node plus arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{node}/{index}")]
pub struct BlockId {
    node: NodeId,
    index: usize,
}

impl BlockId {
    pub(crate) const fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }

    #[must_use]
    pub const fn node(self) -> NodeId {
        self.node
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }
}

/// Bookkeeping of a block that has been handed out.
#[derive(Debug)]
pub(crate) struct InUse {
    pub(crate) pfn: Pfn,
    pub(crate) refs: usize,
    /// The block consumed a global reservation that must be given back if
    /// the block is released before it gets installed.
    pub(crate) restore_reserve: bool,
    /// Quota the block is charged against.
    pub(crate) subpool: Option<Arc<Subpool>>,
    /// Privately owned by page tables rather than by an object's cache.
    pub(crate) anon: bool,
}

impl InUse {
    fn new(pfn: Pfn) -> Self {
        Self {
            pfn,
            refs: 1,
            restore_reserve: false,
            subpool: None,
            anon: false,
        }
    }
}

#[derive(Debug)]
enum Slot {
    Vacant { next: Option<usize> },
    Free { pfn: Pfn, next: Option<usize> },
    InUse(InUse),
}

#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    vacant_head: Option<usize>,
    free_len: usize,
    in_use_len: usize,
}

impl Arena {
    fn claim_slot(&mut self, slot: Slot) -> usize {
        let Some(index) = self.vacant_head else {
            self.slots.push(slot);
            return self.slots.len() - 1;
        };
        let old = mem::replace(&mut self.slots[index], slot);
        let Slot::Vacant { next } = old else {
            panic!("vacant list points at {old:?}");
        };
        self.vacant_head = next;
        index
    }

    /// Links a new block at the head of the free list.
    pub(crate) fn push_free(&mut self, pfn: Pfn) -> usize {
        let index = self.claim_slot(Slot::Free {
            pfn,
            next: self.free_head,
        });
        self.free_head = Some(index);
        self.free_len += 1;
        index
    }

    /// Stores a new block directly in the in-use state.
    pub(crate) fn insert_in_use(&mut self, pfn: Pfn) -> usize {
        self.in_use_len += 1;
        self.claim_slot(Slot::InUse(InUse::new(pfn)))
    }

    /// Moves the head of the free list to the in-use state.
    pub(crate) fn pop_free(&mut self) -> Option<usize> {
        let index = self.free_head?;
        let slot = &mut self.slots[index];
        let Slot::Free { pfn, next } = *slot else {
            panic!("free list points at {slot:?}");
        };
        *slot = Slot::InUse(InUse::new(pfn));
        self.free_head = next;
        self.free_len -= 1;
        self.in_use_len += 1;
        Some(index)
    }

    /// Unlinks the head of the free list and vacates its slot.
    pub(crate) fn take_free(&mut self) -> Option<Pfn> {
        let index = self.free_head?;
        let vacant = Slot::Vacant {
            next: self.vacant_head,
        };
        let old = mem::replace(&mut self.slots[index], vacant);
        let Slot::Free { pfn, next } = old else {
            panic!("free list points at {old:?}");
        };
        self.vacant_head = Some(index);
        self.free_head = next;
        self.free_len -= 1;
        Some(pfn)
    }

    /// Ends the in-use state of a block whose last reference is gone.
    ///
    /// With `keep` the block goes back on the free list, otherwise its slot
    /// is vacated and the caller hands the frame back to the source.
    pub(crate) fn retire(&mut self, index: usize, keep: bool) -> Pfn {
        let vacant = Slot::Vacant {
            next: self.vacant_head,
        };
        let old = mem::replace(&mut self.slots[index], vacant);
        let Slot::InUse(block) = old else {
            panic!("retiring block in slot {index} that is not in use: {old:?}");
        };
        assert_eq!(block.refs, 0, "retiring referenced block");
        assert!(block.subpool.is_none(), "retiring block still charged");
        if keep {
            self.slots[index] = Slot::Free {
                pfn: block.pfn,
                next: self.free_head,
            };
            self.free_head = Some(index);
            self.free_len += 1;
        } else {
            self.vacant_head = Some(index);
        }
        self.in_use_len -= 1;
        block.pfn
    }

    /// # Panics
    ///
    /// Panics if the slot does not hold an in-use block.
    pub(crate) fn in_use_mut(&mut self, index: usize) -> &mut InUse {
        match self.slots.get_mut(index) {
            Some(Slot::InUse(block)) => block,
            slot => panic!("slot {index} is not in use: {slot:?}"),
        }
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free_len
    }

    pub(crate) fn in_use_len(&self) -> usize {
        self.in_use_len
    }
}

/// A counted reference to an in-use block.
///
/// Page-table entries and object caches each hold one. Cloning takes another
/// reference; dropping the last one returns the block to its class, which
/// either re-enqueues it or hands it back to the block source.
///
/// A `BlockRef` must not be dropped while the class lock is held.
pub struct BlockRef {
    pool: Arc<PoolClass>,
    id: BlockId,
    pfn: Pfn,
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRef")
            .field("order", &self.pool.order())
            .field("id", &self.id)
            .field("pfn", &self.pfn)
            .finish()
    }
}

impl BlockRef {
    /// Wraps a reference the caller already owns.
    pub(crate) fn from_raw(pool: Arc<PoolClass>, id: BlockId, pfn: Pfn) -> Self {
        Self { pool, id, pfn }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.id.node()
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PoolClass> {
        &self.pool
    }

    /// Returns `true` if both handles refer to the same block.
    #[must_use]
    pub fn same_block(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.pool, &other.pool)
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.pool.with_in_use(self.id, |b| b.refs)
    }

    #[must_use]
    pub fn is_anon(&self) -> bool {
        self.pool.with_in_use(self.id, |b| b.anon)
    }

    pub(crate) fn set_anon(&self) {
        self.pool.with_in_use(self.id, |b| b.anon = true);
    }

    #[must_use]
    pub fn restores_reserve(&self) -> bool {
        self.pool.with_in_use(self.id, |b| b.restore_reserve)
    }

    /// Called once the block is installed: the reservation it consumed is
    /// now permanently used.
    pub(crate) fn clear_restore_reserve(&self) {
        self.pool.with_in_use(self.id, |b| b.restore_reserve = false);
    }

    pub(crate) fn set_subpool(&self, subpool: Option<Arc<Subpool>>) {
        let old = self
            .pool
            .with_in_use(self.id, |b| mem::replace(&mut b.subpool, subpool));
        drop(old);
    }
}

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        self.pool.get_block(self.id);
        Self {
            pool: Arc::clone(&self.pool),
            id: self.id,
            pfn: self.pfn,
        }
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        self.pool.put_block(self.id);
    }
}
