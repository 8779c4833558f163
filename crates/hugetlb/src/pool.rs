//! A class of huge blocks of one order.
//!
//! A [`PoolClass`] keeps the global and per-node counters of its blocks,
//! the per-node free lists and two node cursors:
//!
//! - `total`: blocks owned by the class, free or in use,
//! - `free`: blocks on the free lists,
//! - `reserved`: free blocks promised to reservations that have not faulted
//!   yet,
//! - `surplus`: blocks above the persistent size, allocated on demand within
//!   the overcommit ceiling and given back first when no longer needed.
//!
//! All of this sits behind one lock per class.

use alloc::{sync::Arc, vec::Vec};
use core::{fmt, mem};

use arrayvec::ArrayVec;
use snafu::{Snafu, ensure};
use snafu_utils::Location;
use spin::mutex::SpinMutex;

use crate::{
    PAGE_SIZE,
    block::{Arena, BlockId, BlockRef, InUse},
    node::{MAX_NODES, NodeCursor, NodeId, NodeMask},
    source::{AbortSignal, BlockSource, Pfn},
    stats::{NodeStats, PoolStats},
    subpool,
};

#[derive(Debug, Snafu)]
pub enum PoolError {
    #[snafu(display(
        "cannot reserve {requested} blocks of order {order}: {missing} more could not be allocated"
    ))]
    GatherSurplus {
        order: u32,
        requested: usize,
        missing: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{node} is not served by the order {order} class"))]
    UnknownNode {
        order: u32,
        node: NodeId,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Debug, Default)]
struct NodePool {
    total: usize,
    free: usize,
    surplus: usize,
    arena: Arena,
}

#[derive(Debug)]
struct PoolState {
    total: usize,
    free: usize,
    reserved: usize,
    surplus: usize,
    overcommit: usize,
    nodes: ArrayVec<NodePool, MAX_NODES>,
    alloc_cursor: NodeCursor,
    free_cursor: NodeCursor,
}

impl PoolState {
    fn persistent(&self) -> usize {
        self.total - self.surplus
    }

    fn check(&self) {
        debug_assert!(self.free <= self.total, "free above total: {self:?}");
        debug_assert!(self.surplus <= self.total, "surplus above total");
        debug_assert!(self.reserved <= self.free, "reserved above free");
    }

    /// Accounts a fresh persistent block and puts it on its free list.
    fn enqueue_fresh(&mut self, node: NodeId, pfn: Pfn) {
        let np = &mut self.nodes[node.index()];
        np.arena.push_free(pfn);
        np.total += 1;
        np.free += 1;
        self.total += 1;
        self.free += 1;
    }

    /// Accounts a surplus block allocated by [`PoolClass::alloc_surplus_raw`].
    fn account_surplus(&mut self, node: NodeId) {
        let np = &mut self.nodes[node.index()];
        np.total += 1;
        np.surplus += 1;
        self.total += 1;
        self.surplus += 1;
    }

    /// Reverts [`account_surplus`](Self::account_surplus) for a block that was
    /// never enqueued. Returns `true` if the caller must release the block.
    ///
    /// A block freed on the node in the meantime may have used up the node's
    /// surplus count already; the block is then kept as a persistent free
    /// block instead.
    fn unaccount_surplus(&mut self, node: NodeId, pfn: Pfn) -> bool {
        let np = &mut self.nodes[node.index()];
        if np.surplus == 0 {
            np.arena.push_free(pfn);
            np.free += 1;
            self.free += 1;
            return false;
        }
        np.total -= 1;
        np.surplus -= 1;
        self.total -= 1;
        self.surplus -= 1;
        true
    }

    /// Puts an already accounted surplus block on its free list.
    fn enqueue_surplus(&mut self, node: NodeId, pfn: Pfn) {
        let np = &mut self.nodes[node.index()];
        np.arena.push_free(pfn);
        np.free += 1;
        self.free += 1;
    }

    /// Turns one surplus block into a persistent one, walking nodes with the
    /// growth cursor.
    fn unmark_surplus(&mut self, nodes: NodeMask) -> bool {
        for _ in 0..nodes.len() {
            let Some(node) = self.alloc_cursor.advance(nodes) else {
                break;
            };
            let np = &mut self.nodes[node.index()];
            if np.surplus > 0 {
                np.surplus -= 1;
                self.surplus -= 1;
                return true;
            }
        }
        false
    }

    /// Turns one persistent block into a surplus one, walking nodes with the
    /// shrink cursor.
    fn mark_surplus(&mut self, nodes: NodeMask) -> bool {
        for _ in 0..nodes.len() {
            let Some(node) = self.free_cursor.advance(nodes) else {
                break;
            };
            let np = &mut self.nodes[node.index()];
            if np.surplus < np.total {
                np.surplus += 1;
                self.surplus += 1;
                return true;
            }
        }
        false
    }

    /// Takes a free block out of the class, walking nodes with the shrink
    /// cursor. With `surplus_only`, only nodes carrying surplus qualify and
    /// the block is taken out of the surplus count.
    fn remove_free(&mut self, nodes: NodeMask, surplus_only: bool) -> Option<Pfn> {
        for _ in 0..nodes.len() {
            let node = self.free_cursor.advance(nodes)?;
            let np = &mut self.nodes[node.index()];
            let eligible = if surplus_only {
                np.surplus > 0
            } else {
                np.total > np.surplus
            };
            if !eligible || np.free == 0 {
                continue;
            }
            let pfn = np.arena.take_free()?;
            np.free -= 1;
            np.total -= 1;
            self.free -= 1;
            self.total -= 1;
            if surplus_only {
                self.nodes[node.index()].surplus -= 1;
                self.surplus -= 1;
            }
            return Some(pfn);
        }
        None
    }
}

/// One block order's pool.
pub struct PoolClass {
    order: u32,
    nodes: NodeMask,
    source: Arc<dyn BlockSource>,
    state: SpinMutex<PoolState>,
    /// Serializes [`set_target`](Self::set_target) callers.
    resize: SpinMutex<()>,
}

impl fmt::Debug for PoolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolClass")
            .field("order", &self.order)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

impl PoolClass {
    /// Creates an empty class serving `nodes`.
    ///
    /// # Panics
    ///
    /// Panics if `nodes` is empty.
    #[must_use]
    pub fn new(order: u32, nodes: NodeMask, source: Arc<dyn BlockSource>) -> Arc<Self> {
        let (Some(first), Some(last)) = (nodes.first(), nodes.last()) else {
            panic!("pool class without nodes");
        };
        let mut node_pools = ArrayVec::new();
        for _ in 0..=last.index() {
            node_pools.push(NodePool::default());
        }
        Arc::new(Self {
            order,
            nodes,
            source,
            state: SpinMutex::new(PoolState {
                total: 0,
                free: 0,
                reserved: 0,
                surplus: 0,
                overcommit: 0,
                nodes: node_pools,
                alloc_cursor: NodeCursor::new(first),
                free_cursor: NodeCursor::new(first),
            }),
            resize: SpinMutex::new(()),
        })
    }

    #[must_use]
    pub fn order(&self) -> u32 {
        self.order
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        PAGE_SIZE << self.order
    }

    #[must_use]
    pub fn nodes(&self) -> NodeMask {
        self.nodes
    }

    pub(crate) fn source(&self) -> &dyn BlockSource {
        &*self.source
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            order: self.order,
            block_size: self.block_size(),
            total: state.total,
            free: state.free,
            reserved: state.reserved,
            surplus: state.surplus,
            overcommit: state.overcommit,
        }
    }

    #[must_use]
    pub fn node_stats(&self, node: NodeId) -> Option<NodeStats> {
        if !self.nodes.contains(node) {
            return None;
        }
        let state = self.state.lock();
        let np = &state.nodes[node.index()];
        debug_assert_eq!(np.free, np.arena.free_len());
        Some(NodeStats {
            node,
            total: np.total,
            free: np.free,
            surplus: np.surplus,
            in_use: np.arena.in_use_len(),
        })
    }

    /// Sets how many surplus blocks may exist at once.
    pub fn set_overcommit(&self, overcommit: usize) {
        self.state.lock().overcommit = overcommit;
        debug!("order {} overcommit set to {overcommit}", self.order);
    }

    /// Tries each node of `nodes` once, starting at the cursor.
    fn alloc_fresh(&self, cursor: &mut NodeCursor, nodes: NodeMask) -> Option<(NodeId, Pfn)> {
        for _ in 0..nodes.len() {
            let node = cursor.advance(nodes)?;
            if let Some(pfn) = self.source.allocate(self.order, node) {
                return Some((node, pfn));
            }
        }
        None
    }

    /// Reconciles the persistent size of the class with `count`.
    ///
    /// Growth first converts surplus blocks to persistent ones, then
    /// allocates fresh blocks on `nodes` round-robin until the target is met,
    /// the source runs dry or `abort` fires. Shrinking never goes below the
    /// blocks that are in use or promised to reservations; the remainder of
    /// an unreachable shrink is marked surplus so it is released as soon as
    /// it is freed.
    ///
    /// Returns the resulting persistent size.
    pub fn set_target(&self, count: usize, nodes: NodeMask, abort: &dyn AbortSignal) -> usize {
        let nodes = nodes.intersection(self.nodes);
        let _resize = self.resize.lock();
        let mut state = self.state.lock();
        let before = state.persistent();

        while state.surplus > 0 && count > state.persistent() {
            if !state.unmark_surplus(nodes) {
                break;
            }
        }

        while count > state.persistent() {
            if abort.is_pending() {
                debug!("order {} resize aborted", self.order);
                break;
            }
            let mut cursor = state.alloc_cursor;
            drop(state);
            let fresh = self.alloc_fresh(&mut cursor, nodes);
            state = self.state.lock();
            state.alloc_cursor = cursor;
            let Some((node, pfn)) = fresh else {
                break;
            };
            state.enqueue_fresh(node, pfn);
        }

        let floor = state.reserved + state.total - state.free;
        let target = usize::max(count, floor);
        let mut released = Vec::new();
        while target < state.persistent() {
            let Some(pfn) = state.remove_free(nodes, false) else {
                break;
            };
            released.push(pfn);
        }
        while count < state.persistent() {
            if !state.mark_surplus(nodes) {
                break;
            }
        }

        state.check();
        let persistent = state.persistent();
        drop(state);

        for pfn in released {
            self.source.release(pfn, self.order);
        }
        info!(
            "order {} pool resized: requested={count} before={before} after={persistent}",
            self.order
        );
        persistent
    }

    /// Sets the number of blocks on `node` alone.
    pub fn set_node_target(
        &self,
        node: NodeId,
        count: usize,
        abort: &dyn AbortSignal,
    ) -> Result<usize, PoolError> {
        ensure!(
            self.nodes.contains(node),
            UnknownNodeSnafu {
                order: self.order,
                node
            }
        );
        let count = {
            let state = self.state.lock();
            let np = &state.nodes[node.index()];
            count + state.persistent() - (np.total - np.surplus)
        };
        Ok(self.set_target(count, NodeMask::single(node), abort))
    }

    /// Allocates and accounts one surplus block, honoring the overcommit
    /// ceiling. The block is neither free nor in use yet.
    fn alloc_surplus_raw(&self, preferred: Option<NodeId>) -> Option<(NodeId, Pfn)> {
        let mut cursor = {
            let state = self.state.lock();
            if state.surplus >= state.overcommit {
                return None;
            }
            preferred.map_or(state.alloc_cursor, NodeCursor::new)
        };
        let fresh = self.alloc_fresh(&mut cursor, self.nodes);
        let mut state = self.state.lock();
        if preferred.is_none() {
            state.alloc_cursor = cursor;
        }
        let (node, pfn) = fresh?;
        if state.surplus >= state.overcommit {
            drop(state);
            self.source.release(pfn, self.order);
            return None;
        }
        state.account_surplus(node);
        Some((node, pfn))
    }

    /// Allocates one surplus block straight into the in-use state.
    pub fn alloc_surplus(self: &Arc<Self>, preferred: Option<NodeId>) -> Option<BlockRef> {
        let (node, pfn) = self.alloc_surplus_raw(preferred)?;
        let index = self.state.lock().nodes[node.index()]
            .arena
            .insert_in_use(pfn);
        trace!("order {} surplus block {pfn} allocated on {node}", self.order);
        Some(BlockRef::from_raw(
            Arc::clone(self),
            BlockId::new(node, index),
            pfn,
        ))
    }

    /// Takes a free block, preferring `preferred` and falling back over the
    /// other nodes of the class.
    ///
    /// Without `use_reserve` the call refuses to touch blocks promised to
    /// reservations. With it, the block consumes one reservation and is
    /// tagged to give it back if released before being installed.
    ///
    /// # Panics
    ///
    /// Panics if `use_reserve` is set but nothing is reserved.
    pub fn dequeue(self: &Arc<Self>, preferred: Option<NodeId>, use_reserve: bool) -> Option<BlockRef> {
        let mut state = self.state.lock();
        if use_reserve {
            assert!(
                state.reserved > 0,
                "order {} reservation consumed but none outstanding",
                self.order
            );
        } else if state.free <= state.reserved {
            return None;
        }

        let start = preferred
            .filter(|n| self.nodes.contains(*n))
            .or_else(|| self.nodes.first())?;
        for node in self.nodes.iter_from(start) {
            let np = &mut state.nodes[node.index()];
            let Some(index) = np.arena.pop_free() else {
                continue;
            };
            np.free -= 1;
            let block = np.arena.in_use_mut(index);
            block.restore_reserve = use_reserve;
            let pfn = block.pfn;
            state.free -= 1;
            if use_reserve {
                state.reserved -= 1;
            }
            state.check();
            drop(state);

            let id = BlockId::new(node, index);
            trace!(
                "order {} dequeued block {id} ({pfn}), reserve={use_reserve}",
                self.order
            );
            return Some(BlockRef::from_raw(Arc::clone(self), id, pfn));
        }
        None
    }

    /// Grows the reserved count by exactly `delta`.
    ///
    /// Free blocks not yet promised are used first; the shortfall is
    /// allocated as surplus blocks, within the overcommit ceiling. If the
    /// shortfall cannot be covered, every block allocated by this call is
    /// given back and the class is left as it was.
    pub fn gather_surplus(&self, delta: usize) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let mut needed = (state.reserved + delta).saturating_sub(state.free);
        if needed == 0 {
            state.reserved += delta;
            return Ok(());
        }

        let mut allocated: Vec<(NodeId, Pfn)> = Vec::new();
        let outcome = loop {
            drop(state);
            let mut alloc_ok = true;
            for _ in 0..needed {
                let Some(block) = self.alloc_surplus_raw(None) else {
                    alloc_ok = false;
                    break;
                };
                allocated.push(block);
            }
            state = self.state.lock();
            needed = (state.reserved + delta).saturating_sub(state.free + allocated.len());
            if needed == 0 {
                break Ok(());
            }
            if !alloc_ok {
                break Err(needed);
            }
        };

        let keep = match outcome {
            Ok(()) => {
                let keep = (state.reserved + delta)
                    .saturating_sub(state.free)
                    .min(allocated.len());
                state.reserved += delta;
                for &(node, pfn) in &allocated[..keep] {
                    state.enqueue_surplus(node, pfn);
                }
                keep
            }
            Err(_) => 0,
        };
        let mut released = Vec::new();
        for (node, pfn) in allocated.split_off(keep) {
            if state.unaccount_surplus(node, pfn) {
                released.push(pfn);
            }
        }
        state.check();
        drop(state);

        for pfn in released {
            self.source.release(pfn, self.order);
        }
        match outcome {
            Ok(()) => {
                debug!(
                    "order {} reserved {delta} blocks, {keep} of them new surplus",
                    self.order
                );
                Ok(())
            }
            Err(missing) => {
                debug!(
                    "order {} reservation of {delta} rolled back, {missing} blocks short",
                    self.order
                );
                GatherSurplusSnafu {
                    order: self.order,
                    requested: delta,
                    missing,
                }
                .fail()
            }
        }
    }

    /// Gives back `unused` reservations and releases up to as many free
    /// surplus blocks to the source.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `unused` blocks are reserved.
    pub fn return_unused_surplus(&self, unused: usize) {
        if unused == 0 {
            return;
        }
        let mut state = self.state.lock();
        assert!(
            state.reserved >= unused,
            "order {} unreserving {unused} blocks, only {} reserved",
            self.order,
            state.reserved
        );
        state.reserved -= unused;
        let count = usize::min(unused, state.surplus);
        let mut released = Vec::new();
        for _ in 0..count {
            let Some(pfn) = state.remove_free(self.nodes, true) else {
                break;
            };
            released.push(pfn);
        }
        state.check();
        drop(state);

        if !released.is_empty() {
            debug!(
                "order {} released {} surplus blocks",
                self.order,
                released.len()
            );
        }
        for pfn in released {
            self.source.release(pfn, self.order);
        }
    }

    /// Reserves (`delta > 0`) or unreserves (`delta < 0`) global capacity.
    pub fn acct(&self, delta: isize) -> Result<(), PoolError> {
        if delta >= 0 {
            self.gather_surplus(delta.unsigned_abs())
        } else {
            self.return_unused_surplus(delta.unsigned_abs());
            Ok(())
        }
    }

    pub(crate) fn with_in_use<T>(&self, id: BlockId, f: impl FnOnce(&mut InUse) -> T) -> T {
        let mut state = self.state.lock();
        f(state.nodes[id.node().index()].arena.in_use_mut(id.index()))
    }

    pub(crate) fn get_block(&self, id: BlockId) {
        self.with_in_use(id, |b| {
            assert!(b.refs > 0, "reviving released block {id}");
            b.refs += 1;
        });
    }

    /// Drops one reference; the last one frees the block.
    ///
    /// A freed block gives back the reservation it consumed if it never got
    /// installed, and its quota charge. It returns to the source if its node
    /// carries surplus, otherwise to the free list. A block whose
    /// reservation is given back always returns to the free list, since the
    /// reservation needs a free block behind it.
    pub(crate) fn put_block(&self, id: BlockId) {
        let (subpool, restore_reserve) = {
            let mut state = self.state.lock();
            let block = state.nodes[id.node().index()]
                .arena
                .in_use_mut(id.index());
            assert!(block.refs > 0, "block {id} released too often");
            block.refs -= 1;
            if block.refs > 0 {
                return;
            }
            (block.subpool.take(), mem::take(&mut block.restore_reserve))
        };

        let restore_reserve =
            restore_reserve || subpool::put_blocks(subpool.as_deref(), 1) == 0;
        drop(subpool);

        let mut state = self.state.lock();
        if restore_reserve {
            state.reserved += 1;
        }
        let np = &mut state.nodes[id.node().index()];
        let keep = restore_reserve || np.surplus == 0;
        let pfn = np.arena.retire(id.index(), keep);
        if keep {
            np.free += 1;
            state.free += 1;
        } else {
            np.surplus -= 1;
            np.total -= 1;
            state.surplus -= 1;
            state.total -= 1;
        }
        state.check();
        drop(state);

        if !keep {
            self.source.release(pfn, self.order);
        }
        trace!(
            "order {} block {id} ({pfn}) freed, kept={keep}, restored={restore_reserve}",
            self.order
        );
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let state = self.state.lock();
        let mut total = 0;
        let mut free = 0;
        let mut surplus = 0;
        for node in self.nodes.iter() {
            let np = &state.nodes[node.index()];
            assert_eq!(np.free, np.arena.free_len(), "{node} free list length");
            assert!(np.surplus <= np.total);
            total += np.total;
            free += np.free;
            surplus += np.surplus;
        }
        assert_eq!(state.total, total);
        assert_eq!(state.free, free);
        assert_eq!(state.surplus, surplus);
        assert!(state.reserved <= state.free);
    }
}
