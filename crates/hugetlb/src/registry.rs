//! The set of configured pool classes.

use alloc::{sync::Arc, vec::Vec};

use snafu::ensure;

use crate::{
    config::{ConfigError, DuplicateOrderSnafu, PoolConfig},
    pool::PoolClass,
    source::{BlockSource, NeverAbort},
    stats::PoolStats,
};

#[derive(Debug)]
pub struct Registry {
    classes: Vec<Arc<PoolClass>>,
}

impl Registry {
    /// Builds one class per configuration and fills each with its initial
    /// blocks.
    ///
    /// The first configuration names the default class. A class whose source
    /// cannot supply every initial block is created smaller.
    pub fn new(source: &Arc<dyn BlockSource>, configs: &[PoolConfig]) -> Result<Self, ConfigError> {
        for (i, config) in configs.iter().enumerate() {
            config.validate()?;
            ensure!(
                configs[..i].iter().all(|c| c.order != config.order),
                DuplicateOrderSnafu {
                    order: config.order
                }
            );
        }

        let classes = configs
            .iter()
            .map(|config| {
                let class = PoolClass::new(config.order, config.nodes, Arc::clone(source));
                class.set_overcommit(config.overcommit);
                let total = class.set_target(config.initial_blocks, config.nodes, &NeverAbort);
                if total < config.initial_blocks {
                    warn!(
                        "order {} class got {total} of {} initial blocks",
                        config.order, config.initial_blocks
                    );
                }
                class
            })
            .collect();
        Ok(Self { classes })
    }

    #[must_use]
    pub fn class(&self, order: u32) -> Option<&Arc<PoolClass>> {
        self.classes.iter().find(|c| c.order() == order)
    }

    #[must_use]
    pub fn default_class(&self) -> Option<&Arc<PoolClass>> {
        self.classes.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PoolClass>> {
        self.classes.iter()
    }

    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        self.classes.iter().map(|c| c.stats()).collect()
    }
}
