// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{BufferAllocator, BufferManager, BufferPosition, PoolGeometry};
use crate::core::{PipelineError, Result};

/// Named pool definition, as it appears in pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    pub name: String,
    #[serde(flatten)]
    pub geometry: PoolGeometry,
}

/// Registry of buffer pools keyed by role ("sensor", "preview", "jpeg", ...).
#[derive(Default)]
pub struct BufferPools {
    pools: RwLock<BTreeMap<String, Arc<BufferManager>>>,
}

impl BufferPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, configure and allocate one pool per definition.
    pub fn from_configs(
        configs: &[BufferPoolConfig],
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self> {
        let pools = Self::new();
        for config in configs {
            let pool = BufferManager::new(config.name.clone(), Arc::clone(&allocator));
            pool.configure(config.geometry.clone())?;
            pool.allocate()?;
            pools.insert(pool)?;
        }
        Ok(pools)
    }

    pub fn insert(&self, pool: Arc<BufferManager>) -> Result<()> {
        let mut pools = self.pools.write();
        if pools.contains_key(pool.name()) {
            return Err(PipelineError::Configuration(format!(
                "duplicate buffer pool '{}'",
                pool.name()
            )));
        }
        pools.insert(pool.name().to_string(), pool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<BufferManager>> {
        self.pools.read().get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<BufferManager>> {
        self.get(name)
            .ok_or_else(|| PipelineError::NotFound(format!("buffer pool '{}'", name)))
    }

    pub fn names(&self) -> Vec<String> {
        self.pools.read().keys().cloned().collect()
    }

    /// Buffers not FREE across all pools.
    pub fn busy_count(&self) -> usize {
        self.pools
            .read()
            .values()
            .map(|pool| pool.allocated_count() - pool.count_in(BufferPosition::Free))
            .sum()
    }

    /// Cheap mode switch: every pool back to FREE, memory kept.
    pub fn reset_all(&self) {
        for pool in self.pools.read().values() {
            pool.reset();
        }
    }

    pub fn deinit_all(&self) {
        for pool in self.pools.read().values() {
            pool.deinit();
        }
    }
}

impl std::fmt::Debug for BufferPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPools")
            .field("pools", &self.names())
            .finish()
    }
}
