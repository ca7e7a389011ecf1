//! In-memory cache manager backed by
//! [`moka`](https://github.com/moka-rs/moka).

use std::fmt;
use std::sync::Arc;

use moka::future::Cache;

use super::KeyLocks;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::storage::{CacheManager, EntryMutator};

/// Implements [`CacheManager`] with [`moka`](https://github.com/moka-rs/moka)
/// as the backend.
///
/// Updates serialize through a per-key lock, so in-process write-write races
/// cannot occur and the retry budget never comes into play.
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
#[derive(Clone)]
pub struct MokaManager {
    /// The instance of `moka::future::Cache`
    pub cache: Arc<Cache<String, Arc<Vec<u8>>>>,
    locks: KeyLocks,
}

impl fmt::Debug for MokaManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MokaManager").finish_non_exhaustive()
    }
}

impl Default for MokaManager {
    fn default() -> Self {
        Self::new(Cache::new(1000))
    }
}

impl MokaManager {
    /// Creates a new manager from a pre-configured cache.
    pub fn new(cache: Cache<String, Arc<Vec<u8>>>) -> Self {
        Self { cache: Arc::new(cache), locks: KeyLocks::new() }
    }

    /// Creates a manager capped at `max_entries` entries.
    #[must_use]
    pub fn with_capacity(max_entries: u64) -> Self {
        Self::new(Cache::new(max_entries))
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) -> Result<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    fn decode(raw: &[u8]) -> Result<CacheEntry> {
        Ok(bincode::deserialize(raw)?)
    }

    fn encode(entry: &CacheEntry) -> Result<Arc<Vec<u8>>> {
        Ok(Arc::new(bincode::serialize(entry)?))
    }
}

#[async_trait::async_trait]
impl CacheManager for MokaManager {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.cache.get(key).await {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: String, entry: CacheEntry) -> Result<CacheEntry> {
        let bytes = Self::encode(&entry)?;
        self.cache.insert(key, bytes).await;
        self.cache.run_pending_tasks().await;
        Ok(entry)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        mutator: &dyn EntryMutator,
    ) -> Result<CacheEntry> {
        let lock = self.locks.for_key(key);
        let _guard = lock.lock().await;

        let current = match self.cache.get(key).await {
            Some(raw) => Some(Self::decode(&raw)?),
            None => None,
        };
        let next = mutator.mutate(current.as_ref());
        let bytes = Self::encode(&next)?;
        self.cache.insert(key.to_string(), bytes).await;
        self.cache.run_pending_tasks().await;
        Ok(next)
    }
}
