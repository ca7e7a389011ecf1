//! The storage abstraction the rest of the cache is written against.
//!
//! Heap, disk, and out-of-process stores are interchangeable behind
//! [`CacheManager`]; the executor only ever sees this capability set.
//! Entries read from a manager are immutable snapshots. All mutation goes
//! through [`CacheManager::update`] so an adapter can detect and retry
//! write-write races per key.

use async_trait::async_trait;

use crate::entry::CacheEntry;
use crate::error::Result;

/// Default retry budget for [`CacheManager::update`].
pub const DEFAULT_UPDATE_RETRIES: usize = 3;

/// A read-modify-write step applied under [`CacheManager::update`].
///
/// The mutator MUST be pure and idempotent: an adapter that loses a
/// concurrent-write race re-runs it against the fresher entry.
pub trait EntryMutator: Send + Sync {
    /// Produces the replacement entry from the currently stored one.
    fn mutate(&self, current: Option<&CacheEntry>) -> CacheEntry;
}

impl<F> EntryMutator for F
where
    F: Fn(Option<&CacheEntry>) -> CacheEntry + Send + Sync,
{
    fn mutate(&self, current: Option<&CacheEntry>) -> CacheEntry {
        self(current)
    }
}

/// A trait providing methods for storing, reading, removing, and atomically
/// updating cache entries.
#[async_trait]
pub trait CacheManager: Send + Sync + 'static {
    /// Attempts to pull a cached entry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Unconditionally stores an entry.
    async fn put(&self, key: String, entry: CacheEntry) -> Result<CacheEntry>;

    /// Removes an entry. Removing an absent entry is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomic read-modify-write, serializable per key.
    ///
    /// Retries on detected concurrent writes up to the adapter's retry
    /// budget; fails with
    /// [`CacheError::CacheUpdateRetryExhausted`](crate::error::CacheError)
    /// when the budget is spent.
    async fn update(
        &self,
        key: &str,
        mutator: &dyn EntryMutator,
    ) -> Result<CacheEntry>;
}
