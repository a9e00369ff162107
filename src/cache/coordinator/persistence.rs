//! Persistence seam for the facade
//!
//! The facade never knows how values are stored. It reads through an adapter
//! on a cache miss and hands coalesced writes to it after the persist delay.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cache::traits::{CacheValue, LifecycleResult};

/// Storage backend behind a `ResourceFacade`
pub trait PersistenceAdapter<V>: Send + Sync + 'static {
    fn load(&self, key: &str) -> LifecycleResult<Option<V>>;

    fn save(&self, key: &str, value: &V) -> LifecycleResult<()>;

    fn remove(&self, key: &str) -> LifecycleResult<()>;
}

/// In-process adapter, also the default when none is configured
#[derive(Debug, Default)]
pub struct MemoryPersistence<V> {
    values: Mutex<HashMap<String, V>>,
}

impl<V: CacheValue> MemoryPersistence<V> {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, V>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stored value, bypassing any cache in front of the adapter
    pub fn stored(&self, key: &str) -> Option<V> {
        self.lock().get(key).cloned()
    }
}

impl<V: CacheValue> PersistenceAdapter<V> for MemoryPersistence<V> {
    fn load(&self, key: &str) -> LifecycleResult<Option<V>> {
        Ok(self.lock().get(key).cloned())
    }

    fn save(&self, key: &str, value: &V) -> LifecycleResult<()> {
        self.lock().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> LifecycleResult<()> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_round_trip() {
        let store = MemoryPersistence::<u32>::new();
        assert_eq!(store.load("a").unwrap(), None);

        store.save("a", &7).unwrap();
        assert_eq!(store.load("a").unwrap(), Some(7));
        assert_eq!(store.len(), 1);

        store.remove("a").unwrap();
        assert!(store.is_empty());
    }
}
