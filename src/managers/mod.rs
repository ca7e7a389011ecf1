//! Cache manager backend implementations.

#[cfg(feature = "manager-cacache")]
pub mod cacache;

#[cfg(feature = "manager-moka")]
pub mod moka;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-key async locks shared by the manager implementations.
///
/// `update` holds the key's lock across its validate-and-swap so updates
/// serialize per key while reads stay lock-free.
#[derive(Debug, Default, Clone)]
pub(crate) struct KeyLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn for_key(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("key lock map poisoned");
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
