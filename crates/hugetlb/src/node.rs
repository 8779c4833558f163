//! NUMA node identifiers, node sets and round-robin cursors.

use core::{fmt, iter};

/// Largest number of nodes a [`NodeMask`] can describe.
pub const MAX_NODES: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("node{_0}")]
pub struct NodeId(usize);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl NodeId {
    /// # Panics
    ///
    /// Panics if `id` is not below [`MAX_NODES`].
    #[must_use]
    pub const fn new(id: usize) -> Self {
        assert!(id < MAX_NODES, "node id out of range");
        Self(id)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A set of nodes.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct NodeMask(u64);

impl fmt::Debug for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl NodeMask {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the mask of nodes `0..count`.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds [`MAX_NODES`].
    #[must_use]
    pub const fn first_n(count: usize) -> Self {
        assert!(count <= MAX_NODES, "node count out of range");
        if count == MAX_NODES {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    #[must_use]
    pub const fn single(node: NodeId) -> Self {
        Self(1 << node.0)
    }

    pub fn insert(&mut self, node: NodeId) {
        self.0 |= 1 << node.0;
    }

    pub fn remove(&mut self, node: NodeId) {
        self.0 &= !(1 << node.0);
    }

    #[must_use]
    pub const fn contains(self, node: NodeId) -> bool {
        self.0 & (1 << node.0) != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub fn first(self) -> Option<NodeId> {
        (self.0 != 0).then(|| NodeId(self.0.trailing_zeros() as usize))
    }

    #[must_use]
    pub fn last(self) -> Option<NodeId> {
        (self.0 != 0).then(|| NodeId(63 - self.0.leading_zeros() as usize))
    }

    /// Returns the next member after `node`, wrapping around to the first.
    #[must_use]
    pub fn next_after(self, node: NodeId) -> Option<NodeId> {
        let above = if node.0 + 1 >= MAX_NODES {
            0
        } else {
            self.0 & (u64::MAX << (node.0 + 1))
        };
        if above == 0 {
            self.first()
        } else {
            Some(NodeId(above.trailing_zeros() as usize))
        }
    }

    pub fn iter(self) -> impl Iterator<Item = NodeId> {
        (0..MAX_NODES).map(NodeId).filter(move |n| self.contains(*n))
    }

    /// Iterates every member once, starting at `start` (or the member after
    /// it) and wrapping around.
    pub fn iter_from(self, start: NodeId) -> impl Iterator<Item = NodeId> {
        let first = if self.contains(start) {
            Some(start)
        } else {
            self.next_after(start)
        };
        iter::successors(first, move |n| self.next_after(*n)).take(self.len())
    }
}

impl FromIterator<NodeId> for NodeMask {
    fn from_iter<T: IntoIterator<Item = NodeId>>(iter: T) -> Self {
        let mut mask = Self::empty();
        for node in iter {
            mask.insert(node);
        }
        mask
    }
}

/// Round-robin position over a node mask.
///
/// Each class owns two of these, one pacing growth and one pacing shrink, so
/// repeated resizes spread blocks evenly across the allowed nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCursor {
    next: NodeId,
}

impl NodeCursor {
    #[must_use]
    pub const fn new(start: NodeId) -> Self {
        Self { next: start }
    }

    /// Returns the node to use now and moves past it.
    ///
    /// If the remembered position is not in `mask`, the next member of `mask`
    /// is used instead. Returns `None` only for an empty mask.
    pub fn advance(&mut self, mask: NodeMask) -> Option<NodeId> {
        let node = if mask.contains(self.next) {
            self.next
        } else {
            mask.next_after(self.next)?
        };
        self.next = mask.next_after(node).unwrap_or(node);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(ids: &[usize]) -> NodeMask {
        ids.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn test_first_n() {
        assert_eq!(NodeMask::first_n(0), NodeMask::empty());
        assert_eq!(NodeMask::first_n(3), mask(&[0, 1, 2]));
        assert_eq!(NodeMask::first_n(MAX_NODES).len(), MAX_NODES);
    }

    #[test]
    fn test_next_after_wraps() {
        let m = mask(&[1, 4, 63]);
        assert_eq!(m.next_after(NodeId::new(1)), Some(NodeId::new(4)));
        assert_eq!(m.next_after(NodeId::new(4)), Some(NodeId::new(63)));
        assert_eq!(m.next_after(NodeId::new(63)), Some(NodeId::new(1)));
        assert_eq!(m.next_after(NodeId::new(0)), Some(NodeId::new(1)));
        assert_eq!(NodeMask::empty().next_after(NodeId::new(0)), None);
    }

    #[test]
    fn test_iter_from() {
        let m = mask(&[0, 2, 3]);
        let order: Vec<_> = m.iter_from(NodeId::new(2)).map(NodeId::index).collect();
        assert_eq!(order, [2, 3, 0]);
        let order: Vec<_> = m.iter_from(NodeId::new(1)).map(NodeId::index).collect();
        assert_eq!(order, [2, 3, 0]);
    }

    #[test]
    fn test_cursor_round_robin() {
        let m = mask(&[0, 1, 2]);
        let mut cursor = NodeCursor::new(NodeId::new(0));
        let picks: Vec<_> = (0..7)
            .map(|_| cursor.advance(m).unwrap().index())
            .collect();
        assert_eq!(picks, [0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_cursor_skips_disallowed_nodes() {
        let mut cursor = NodeCursor::new(NodeId::new(1));
        let m = mask(&[0, 3]);
        assert_eq!(cursor.advance(m), Some(NodeId::new(3)));
        assert_eq!(cursor.advance(m), Some(NodeId::new(0)));
        assert_eq!(cursor.advance(NodeMask::empty()), None);
    }

    #[test]
    fn test_last_and_remove() {
        let mut m = mask(&[2, 5]);
        assert_eq!(m.last(), Some(NodeId::new(5)));
        m.remove(NodeId::new(5));
        assert_eq!(m.last(), Some(NodeId::new(2)));
        assert_eq!(format!("{m:?}"), "{node2}");
    }
}
