//! Typed pool and quota configuration.
//!
//! Values arrive already parsed; they are only range-checked here.

use snafu::{Snafu, ensure};
use snafu_utils::Location;

use crate::node::NodeMask;

/// Largest supported block order (1 GiB blocks of 4 KiB pages).
pub const MAX_ORDER: u32 = 18;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("block order {order} is outside 1..={MAX_ORDER}"))]
    InvalidOrder {
        order: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("order {order} class has no nodes"))]
    NoNodes {
        order: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("minimum of {min} blocks is above the limit of {max}"))]
    MinAboveMax {
        min: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("order {order} configured more than once"))]
    DuplicateOrder {
        order: u32,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Configuration of one pool class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub order: u32,
    pub nodes: NodeMask,
    /// Persistent blocks allocated when the class is created.
    pub initial_blocks: usize,
    /// Most surplus blocks allowed at once.
    pub overcommit: usize,
}

impl PoolConfig {
    /// A class of `order` over `nodes` with nothing preallocated.
    #[must_use]
    pub const fn new(order: u32, nodes: NodeMask) -> Self {
        Self {
            order,
            nodes,
            initial_blocks: 0,
            overcommit: 0,
        }
    }

    #[must_use]
    pub const fn with_initial_blocks(self, initial_blocks: usize) -> Self {
        Self {
            initial_blocks,
            ..self
        }
    }

    #[must_use]
    pub const fn with_overcommit(self, overcommit: usize) -> Self {
        Self { overcommit, ..self }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            (1..=MAX_ORDER).contains(&self.order),
            InvalidOrderSnafu { order: self.order }
        );
        ensure!(!self.nodes.is_empty(), NoNodesSnafu { order: self.order });
        Ok(())
    }
}

/// Quota of one backing object.
///
/// `None` leaves the corresponding bound unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubpoolConfig {
    pub max_blocks: Option<usize>,
    pub min_blocks: Option<usize>,
}

impl SubpoolConfig {
    /// Returns `true` if neither bound is set, in which case no subpool is
    /// needed.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.max_blocks.is_none() && self.min_blocks.is_none()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(min), Some(max)) = (self.min_blocks, self.max_blocks) {
            ensure!(min <= max, MinAboveMaxSnafu { min, max });
        }
        Ok(())
    }
}
