//! Shared resources handed to facades by injection
//!
//! Components never reach for a process-wide instance themselves. The only
//! place the global registry is consulted is `ResourceFacadeBuilder::build`
//! when nothing was injected.

use once_cell::sync::Lazy;

use crate::cache::config::PoolConfig;
use crate::cache::pool::ObjectPool;
use crate::cache::traits::LifecycleResult;

static GLOBAL_REGISTRY: Lazy<ResourceRegistry> = Lazy::new(|| {
    log::debug!("Initializing process-wide resource registry");
    ResourceRegistry {
        pool: ObjectPool::from_validated(PoolConfig::default()),
    }
});

/// Resources shared between facades
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    pool: ObjectPool,
}

impl ResourceRegistry {
    pub fn new(pool_config: PoolConfig) -> LifecycleResult<Self> {
        Ok(Self {
            pool: ObjectPool::new(pool_config)?,
        })
    }

    pub fn with_pool(pool: ObjectPool) -> Self {
        Self { pool }
    }

    /// Process-wide default registry. Its idle sweep runs on the tokio
    /// runtime that first touches it.
    pub fn global() -> &'static ResourceRegistry {
        &GLOBAL_REGISTRY
    }

    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    /// Dispose the shared pool. Facades built on this registry keep working
    /// but no longer retain released instances.
    pub fn dispose(&self) {
        self.pool.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_a_single_instance() {
        let a = ResourceRegistry::global();
        let b = ResourceRegistry::global();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_clones_share_one_pool() {
        let registry = ResourceRegistry::new(PoolConfig {
            enable_gc: false,
            ..Default::default()
        })
        .unwrap();
        let other = registry.clone();
        registry.dispose();
        assert!(other.pool().is_disposed());
    }
}
