//! Interfaces to the collaborators that produce raw memory.

use crate::node::NodeId;

/// Physical frame number of the first page of a block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display, derive_more::From,
)]
#[display("{_0:#x}")]
pub struct Pfn(pub usize);

/// The physical-block allocator the pools draw from.
///
/// Implementations may block (reclaim, compaction) inside [`allocate`]; the
/// engine never calls it with a pool lock held.
///
/// [`allocate`]: BlockSource::allocate
pub trait BlockSource: Send + Sync {
    /// Allocates a naturally aligned block of `order` on exactly `node`.
    fn allocate(&self, order: u32, node: NodeId) -> Option<Pfn>;

    /// Returns a block previously produced by [`allocate`](Self::allocate).
    fn release(&self, pfn: Pfn, order: u32);

    /// Zero-fills a block before it is first mapped.
    fn clear(&self, pfn: Pfn, order: u32);

    /// Copies the contents of `src` into `dst`.
    fn copy(&self, dst: Pfn, src: Pfn, order: u32);
}

/// Checked between allocation attempts of long-running pool growth.
pub trait AbortSignal {
    fn is_pending(&self) -> bool;
}

/// An abort signal that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverAbort;

impl AbortSignal for NeverAbort {
    fn is_pending(&self) -> bool {
        false
    }
}
