//! Per-object block quotas.
//!
//! A [`Subpool`] caps how many blocks one backing object may use
//! (`max_blocks`) and can pre-reserve a minimum from its class at creation
//! (`min_blocks`). Charges against the pre-reserved minimum need no global
//! reservation, so [`Subpool::get`] and [`Subpool::put`] report how much of
//! a request must still be charged to, or may be given back to, the class.
//!
//! An object without quota has no subpool; the free functions of this module
//! treat `None` as unlimited.

use alloc::sync::Arc;

use snafu::{ResultExt as _, Snafu, ensure};
use snafu_utils::Location;
use spin::mutex::SpinMutex;

use crate::{
    config::{ConfigError, SubpoolConfig},
    pool::{PoolClass, PoolError},
};

#[derive(Debug, Snafu)]
pub enum SubpoolError {
    #[snafu(display("quota exceeded: {used} of {max} blocks used, {requested} more requested"))]
    NoSpace {
        requested: usize,
        used: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid subpool configuration"))]
    InvalidConfig {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: ConfigError,
    },
    #[snafu(display("failed to reserve the subpool minimum"))]
    ReserveMinimum {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: PoolError,
    },
}

#[derive(Debug)]
struct SubpoolState {
    /// References held by the owning object. Blocks charged to the subpool
    /// are counted by `used_blocks` instead.
    refs: usize,
    max_blocks: Option<usize>,
    used_blocks: usize,
    min_blocks: Option<usize>,
    /// Part of the minimum currently held as global reservation.
    reserved_blocks: usize,
    released: bool,
}

impl SubpoolState {
    /// Returns the reservation to give back if the subpool must be torn
    /// down now.
    fn teardown(&mut self) -> Option<usize> {
        if self.released || self.refs > 0 || self.used_blocks > 0 {
            return None;
        }
        self.released = true;
        Some(self.reserved_blocks)
    }
}

#[derive(Debug)]
pub struct Subpool {
    pool: Arc<PoolClass>,
    state: SpinMutex<SubpoolState>,
}

impl Subpool {
    /// Creates a subpool with one owner reference, reserving `min_blocks`
    /// from `pool` up front.
    pub fn new(pool: Arc<PoolClass>, config: &SubpoolConfig) -> Result<Arc<Self>, SubpoolError> {
        config.validate().context(InvalidConfigSnafu)?;
        let min = config.min_blocks.unwrap_or(0);
        pool.gather_surplus(min).context(ReserveMinimumSnafu)?;
        Ok(Arc::new(Self {
            pool,
            state: SpinMutex::new(SubpoolState {
                refs: 1,
                max_blocks: config.max_blocks,
                used_blocks: 0,
                min_blocks: config.min_blocks,
                reserved_blocks: min,
                released: false,
            }),
        }))
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PoolClass> {
        &self.pool
    }

    #[must_use]
    pub fn used_blocks(&self) -> usize {
        self.state.lock().used_blocks
    }

    #[must_use]
    pub fn reserved_blocks(&self) -> usize {
        self.state.lock().reserved_blocks
    }

    #[must_use]
    pub fn max_blocks(&self) -> Option<usize> {
        self.state.lock().max_blocks
    }

    #[must_use]
    pub fn min_blocks(&self) -> Option<usize> {
        self.state.lock().min_blocks
    }

    /// Charges `delta` blocks to the quota.
    ///
    /// Returns how many of them must still be reserved globally; the rest
    /// were covered by the pre-reserved minimum. Fails without side effects
    /// if the charge would exceed `max_blocks`.
    pub fn get(&self, delta: usize) -> Result<usize, SubpoolError> {
        let mut state = self.state.lock();
        if let Some(max) = state.max_blocks {
            ensure!(
                state.used_blocks + delta <= max,
                NoSpaceSnafu {
                    requested: delta,
                    used: state.used_blocks,
                    max,
                }
            );
        }
        state.used_blocks += delta;

        let covered = usize::min(delta, state.reserved_blocks);
        state.reserved_blocks -= covered;
        Ok(delta - covered)
    }

    /// Uncharges `delta` blocks.
    ///
    /// Returns how many blocks of global reservation the caller should give
    /// back; the rest refill the minimum while usage is below it.
    pub fn put(&self, delta: usize) -> usize {
        let (global, teardown) = {
            let mut state = self.state.lock();
            assert!(
                state.used_blocks >= delta,
                "subpool uncharging {delta} blocks, only {} used",
                state.used_blocks
            );
            state.used_blocks -= delta;

            let mut global = delta;
            let min = state.min_blocks.unwrap_or(0);
            if state.used_blocks < min {
                let refill = usize::min(delta, min - state.reserved_blocks);
                state.reserved_blocks += refill;
                global -= refill;
            }
            (global, state.teardown())
        };
        self.finish_teardown(teardown);
        global
    }

    /// Reverts a [`get`](Self::get) of `delta` that returned `charged`,
    /// restoring the minimum exactly as it was.
    pub(crate) fn cancel(&self, delta: usize, charged: usize) {
        let teardown = {
            let mut state = self.state.lock();
            assert!(state.used_blocks >= delta, "subpool cancel underflow");
            state.used_blocks -= delta;
            state.reserved_blocks += delta - charged;
            state.teardown()
        };
        self.finish_teardown(teardown);
    }

    /// Drops the owner reference. The subpool is torn down once no blocks are
    /// charged to it anymore.
    pub fn release(&self) {
        let teardown = {
            let mut state = self.state.lock();
            assert!(state.refs > 0, "subpool released twice");
            state.refs -= 1;
            state.teardown()
        };
        self.finish_teardown(teardown);
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    fn finish_teardown(&self, teardown: Option<usize>) {
        let Some(reserved) = teardown else {
            return;
        };
        self.pool.return_unused_surplus(reserved);
        debug!(
            "subpool of order {} torn down, {reserved} reserved blocks returned",
            self.pool.order()
        );
    }
}

/// [`Subpool::get`] with `None` as an unlimited quota.
pub fn get_blocks(subpool: Option<&Subpool>, delta: usize) -> Result<usize, SubpoolError> {
    subpool.map_or(Ok(delta), |sp| sp.get(delta))
}

/// [`Subpool::put`] with `None` as an unlimited quota.
pub fn put_blocks(subpool: Option<&Subpool>, delta: usize) -> usize {
    subpool.map_or(delta, |sp| sp.put(delta))
}

pub(crate) fn cancel_blocks(subpool: Option<&Subpool>, delta: usize, charged: usize) {
    if let Some(sp) = subpool {
        sp.cancel(delta, charged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::NodeMask,
        source::{BlockSource, NeverAbort},
        testing::MemorySource,
    };

    fn pool(blocks: usize) -> Arc<PoolClass> {
        let source: Arc<dyn BlockSource> = Arc::new(MemorySource::new(&[16]));
        let pool = PoolClass::new(9, NodeMask::first_n(1), source);
        pool.set_target(blocks, pool.nodes(), &NeverAbort);
        pool
    }

    fn limits(max: Option<usize>, min: Option<usize>) -> SubpoolConfig {
        SubpoolConfig {
            max_blocks: max,
            min_blocks: min,
        }
    }

    #[test]
    fn test_cap_rejects_without_side_effects() {
        let sp = Subpool::new(pool(4), &limits(Some(2), None)).unwrap();
        let err = sp.get(3).unwrap_err();
        assert!(matches!(err, SubpoolError::NoSpace { requested: 3, .. }));
        assert_eq!(sp.used_blocks(), 0);

        assert_eq!(sp.get(2).unwrap(), 2);
        assert!(sp.get(1).is_err());
        assert_eq!(sp.put(2), 2);
        assert_eq!(sp.used_blocks(), 0);
    }

    #[test]
    fn test_get_then_put_restores_usage() {
        let sp = Subpool::new(pool(4), &limits(Some(10), Some(2))).unwrap();
        for delta in [0, 1, 3, 7] {
            let before = (sp.used_blocks(), sp.reserved_blocks());
            let _ = sp.get(delta).unwrap();
            let _ = sp.put(delta);
            assert_eq!((sp.used_blocks(), sp.reserved_blocks()), before);
        }
    }

    #[test]
    fn test_minimum_covers_first_charges() {
        let pool = pool(4);
        let sp = Subpool::new(Arc::clone(&pool), &limits(None, Some(2))).unwrap();
        assert_eq!(pool.stats().reserved, 2);

        assert_eq!(sp.get(1).unwrap(), 0);
        assert_eq!(sp.get(1).unwrap(), 0);
        assert_eq!(sp.get(1).unwrap(), 1);
        assert_eq!(sp.reserved_blocks(), 0);

        assert_eq!(sp.put(1), 1);
        assert_eq!(sp.put(1), 0);
        assert_eq!(sp.put(1), 0);
        assert_eq!(sp.reserved_blocks(), 2);
    }

    #[test]
    fn test_teardown_returns_minimum() {
        let pool = pool(4);
        let sp = Subpool::new(Arc::clone(&pool), &limits(Some(4), Some(3))).unwrap();
        assert_eq!(pool.stats().reserved, 3);

        let charged = sp.get(1).unwrap();
        assert_eq!(charged, 0);
        sp.release();
        assert!(!sp.is_released());
        assert_eq!(pool.stats().reserved, 3);

        assert_eq!(sp.put(1), 0);
        assert!(sp.is_released());
        assert_eq!(pool.stats().reserved, 0);
    }

    #[test]
    fn test_cancel_restores_minimum_exactly() {
        let sp = Subpool::new(pool(4), &limits(Some(8), Some(2))).unwrap();
        let charged = sp.get(3).unwrap();
        assert_eq!(charged, 1);
        sp.cancel(3, charged);
        assert_eq!((sp.used_blocks(), sp.reserved_blocks()), (0, 2));
    }

    #[test]
    fn test_minimum_needs_capacity() {
        let source: Arc<dyn BlockSource> = Arc::new(MemorySource::new(&[1]));
        let pool = PoolClass::new(9, NodeMask::first_n(1), source);
        let err = Subpool::new(Arc::clone(&pool), &limits(None, Some(2))).unwrap_err();
        assert!(matches!(err, SubpoolError::ReserveMinimum { .. }));
        assert_eq!(pool.stats().reserved, 0);

        let err = Subpool::new(pool, &limits(Some(1), Some(2))).unwrap_err();
        assert!(matches!(err, SubpoolError::InvalidConfig { .. }));
    }

    #[test]
    fn test_unlimited() {
        assert_eq!(get_blocks(None, 5).unwrap(), 5);
        assert_eq!(put_blocks(None, 5), 5);
    }
}
