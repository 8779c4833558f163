//! Read-only counter snapshots.

use core::fmt;

use crate::node::NodeId;

/// Class-wide counters, taken atomically under the class lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub order: u32,
    pub block_size: usize,
    pub total: usize,
    pub free: usize,
    pub reserved: usize,
    pub surplus: usize,
    pub overcommit: usize,
}

impl PoolStats {
    /// Blocks that are not surplus.
    #[must_use]
    pub fn persistent(&self) -> usize {
        self.total - self.surplus
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.total - self.free
    }

    /// Blocks that can be handed out without touching a reservation.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free - self.reserved
    }
}

/// Formats like the huge-page section of `/proc/meminfo`.
impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HugePages_Total: {:>8}", self.total)?;
        writeln!(f, "HugePages_Free:  {:>8}", self.free)?;
        writeln!(f, "HugePages_Rsvd:  {:>8}", self.reserved)?;
        writeln!(f, "HugePages_Surp:  {:>8}", self.surplus)?;
        write!(f, "Hugepagesize:    {:>8} kB", self.block_size / 1024)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    pub node: NodeId,
    pub total: usize,
    pub free: usize,
    pub surplus: usize,
    /// Blocks handed out, surplus ones included.
    pub in_use: usize,
}

impl fmt::Display for NodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} HugePages_Total: {} HugePages_Free: {} HugePages_Surp: {}",
            self.node, self.total, self.free, self.surplus
        )
    }
}
