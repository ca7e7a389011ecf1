//! On-disk cache manager backed by
//! [`cacache`](https://github.com/zkat/cacache-rs).

use std::path::PathBuf;

use super::KeyLocks;
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::storage::{CacheManager, EntryMutator, DEFAULT_UPDATE_RETRIES};

/// Implements [`CacheManager`] with
/// [`cacache`](https://github.com/zkat/cacache-rs) as the backend.
///
/// The cache directory may be shared with other processes; `update` therefore
/// verifies its write landed and retries the read-modify-write when an
/// outside writer got there first.
#[cfg_attr(docsrs, doc(cfg(feature = "manager-cacache")))]
#[derive(Debug, Clone)]
pub struct CACacheManager {
    /// Directory where the cache will be stored.
    pub path: PathBuf,
    max_update_retries: usize,
    locks: KeyLocks,
}

impl Default for CACacheManager {
    fn default() -> Self {
        Self::new("./http-cacache".into())
    }
}

impl CACacheManager {
    /// Creates a manager rooted at `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            max_update_retries: DEFAULT_UPDATE_RETRIES,
            locks: KeyLocks::new(),
        }
    }

    /// Overrides the concurrent-write retry budget for `update`.
    #[must_use]
    pub fn max_update_retries(mut self, retries: usize) -> Self {
        self.max_update_retries = retries;
        self
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) -> Result<()> {
        cacache::clear(&self.path).await?;
        Ok(())
    }

    async fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match cacache::read(&self.path, key).await {
            Ok(raw) => Ok(Some(raw)),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait::async_trait]
impl CacheManager for CACacheManager {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.read_raw(key).await? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: String, entry: CacheEntry) -> Result<CacheEntry> {
        let bytes = bincode::serialize(&entry)?;
        cacache::write(&self.path, &key, bytes).await?;
        Ok(entry)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match cacache::remove(&self.path, key).await {
            Ok(()) => Ok(()),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn update(
        &self,
        key: &str,
        mutator: &dyn EntryMutator,
    ) -> Result<CacheEntry> {
        let lock = self.locks.for_key(key);
        let _guard = lock.lock().await;

        let mut attempts = 0;
        loop {
            let observed = self.read_raw(key).await?;
            let current = match &observed {
                Some(raw) => Some(bincode::deserialize::<CacheEntry>(raw)?),
                None => None,
            };
            let next = mutator.mutate(current.as_ref());
            let bytes = bincode::serialize(&next)?;
            cacache::write(&self.path, key, &bytes).await?;

            // An out-of-process writer may have indexed a newer entry between
            // our read and write; the last index entry wins in cacache, so a
            // read-back tells us whether our update survived.
            let committed = self.read_raw(key).await?;
            if committed.as_deref() == Some(bytes.as_slice()) {
                return Ok(next);
            }

            attempts += 1;
            if attempts > self.max_update_retries {
                return Err(CacheError::CacheUpdateRetryExhausted {
                    key: key.to_string(),
                    attempts,
                });
            }
        }
    }
}
