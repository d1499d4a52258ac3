use tracing::debug;

use super::{CacheError, Namespace};
use crate::store::{Store, StoreError};

/// Cache backend over the embedded [`Store`].
///
/// Store calls block on disk I/O, so each one runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct EmbeddedCache {
    store: Store,
    ns: Namespace,
}

impl EmbeddedCache {
    pub fn new(store: Store, prefix: impl Into<String>) -> Self {
        Self {
            store,
            ns: Namespace::new(prefix),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub(crate) async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let full = self.ns.key(key);
        self.blocking(move |store| store.put(full.as_bytes(), &value)).await
    }

    pub(crate) async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let full = self.ns.key(key);
        self.blocking(move |store| store.get(full.as_bytes())).await
    }

    pub(crate) async fn has(&self, key: &str) -> Result<bool, CacheError> {
        let full = self.ns.key(key);
        self.blocking(move |store| store.contains(full.as_bytes())).await
    }

    pub(crate) async fn forget(&self, key: &str) -> Result<(), CacheError> {
        let full = self.ns.key(key);
        self.blocking(move |store| store.delete(full.as_bytes())).await
    }

    pub(crate) async fn empty(&self) -> Result<(), CacheError> {
        self.blocking(Store::drop_all).await?;
        debug!(dir = %self.store.dir().display(), "emptied embedded cache");
        Ok(())
    }

    pub(crate) async fn empty_by_match(&self, prefix: &str) -> Result<(), CacheError> {
        let pattern = self.ns.key(prefix);
        let removed = self
            .blocking(move |store| {
                let keys = store.keys_with_prefix(pattern.as_bytes())?;
                for key in &keys {
                    store.delete(key)?;
                }
                Ok(keys.len())
            })
            .await?;
        debug!(prefix, removed, "emptied embedded cache by prefix");
        Ok(())
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || op(&store)).await??)
    }
}
