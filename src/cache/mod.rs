//! Typed cache facade over the remote or embedded backend.
//!
//! Values are stored as JSON. Every key is namespaced with the configured
//! prefix, so several logical caches can share one physical backend.
//!
//! ```rust,no_run
//! # async fn demo(cache: &cellar::cache::Cache) -> Result<(), cellar::cache::CacheError> {
//! cache.set("user:1", &"Alice").await?;
//! let name: String = cache.get("user:1").await?;
//! assert_eq!(name, "Alice");
//!
//! cache.forget("user:1").await?;
//! assert!(cache.get::<String>("user:1").await.unwrap_err().is_not_found());
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::trace;

use crate::pool::{ConnectionError, PoolError};
use crate::store::StoreError;

mod embedded;
mod remote;

pub use embedded::EmbeddedCache;
pub use remote::RemoteCache;

/// Errors returned by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key is absent. An ordinary outcome, not a failure of the backend.
    #[error("key {0:?} not found in cache")]
    NotFound(String),

    #[error("cached value for {key:?} does not match the requested type: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode value for {key:?}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache backend unavailable: {0}")]
    Unavailable(#[from] PoolError),

    #[error("remote cache error: {0}")]
    Remote(#[from] ConnectionError),

    #[error("embedded store error: {0}")]
    Store(#[from] StoreError),

    #[error("no cache backend is configured")]
    NotConfigured,

    #[error("cache task failed: {0}")]
    Blocking(#[from] JoinError),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }

    /// `true` when the backend could not be reached (or there is none),
    /// as opposed to a bad key or value.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CacheError::Unavailable(_)
                | CacheError::NotConfigured
                | CacheError::Remote(ConnectionError::Io(_) | ConnectionError::Closed)
                | CacheError::Store(StoreError::Closed)
        )
    }
}

/// A key prefix shared by every operation of one facade instance.
///
/// A non-empty prefix is joined to keys with `:` unless it already ends in one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with(':') {
            prefix.push(':');
        }
        Self { prefix }
    }

    /// The normalized prefix, including its trailing `:` (empty if none).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, key: &str) -> String {
        let mut full = String::with_capacity(self.prefix.len() + key.len());
        full.push_str(&self.prefix);
        full.push_str(key);
        full
    }
}

/// The cache facade handed to request handlers and the session store.
#[derive(Debug, Clone)]
pub enum Cache {
    Embedded(EmbeddedCache),
    Remote(RemoteCache),
}

impl Cache {
    pub fn namespace(&self) -> &Namespace {
        match self {
            Cache::Embedded(c) => c.namespace(),
            Cache::Remote(c) => c.namespace(),
        }
    }

    /// Serializes `value` and stores it under `key`.
    pub async fn set<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Encode {
            key: key.to_owned(),
            source,
        })?;
        match self {
            Cache::Embedded(c) => c.set_raw(key, bytes).await,
            Cache::Remote(c) => c.set_raw(key, &bytes).await,
        }
    }

    /// Loads and decodes the value stored under `key`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::NotFound`] if the key is absent.
    /// - [`CacheError::Decode`] if the stored value is not a `T`.
    pub async fn get<T>(&self, key: &str) -> Result<T, CacheError>
    where
        T: DeserializeOwned,
    {
        let raw = match self {
            Cache::Embedded(c) => c.get_raw(key).await?,
            Cache::Remote(c) => c.get_raw(key).await?,
        };
        let Some(bytes) = raw else {
            trace!(key, "cache miss");
            return Err(CacheError::NotFound(key.to_owned()));
        };
        serde_json::from_slice(&bytes).map_err(|source| CacheError::Decode {
            key: key.to_owned(),
            source,
        })
    }

    pub async fn has(&self, key: &str) -> Result<bool, CacheError> {
        match self {
            Cache::Embedded(c) => c.has(key).await,
            Cache::Remote(c) => c.has(key).await,
        }
    }

    /// Deletes `key`. Deleting an absent key succeeds.
    pub async fn forget(&self, key: &str) -> Result<(), CacheError> {
        match self {
            Cache::Embedded(c) => c.forget(key).await,
            Cache::Remote(c) => c.forget(key).await,
        }
    }

    /// Clears the cache.
    ///
    /// The remote backend is shared, so only keys under this instance's
    /// prefix are removed. The embedded store is dedicated and is wiped
    /// entirely.
    pub async fn empty(&self) -> Result<(), CacheError> {
        match self {
            Cache::Embedded(c) => c.empty().await,
            Cache::Remote(c) => c.empty().await,
        }
    }

    /// Deletes every key (within this namespace) that starts with `prefix`.
    pub async fn empty_by_match(&self, prefix: &str) -> Result<(), CacheError> {
        match self {
            Cache::Embedded(c) => c.empty_by_match(prefix).await,
            Cache::Remote(c) => c.empty_by_match(prefix).await,
        }
    }
}

impl From<EmbeddedCache> for Cache {
    fn from(cache: EmbeddedCache) -> Self {
        Cache::Embedded(cache)
    }
}

impl From<RemoteCache> for Cache {
    fn from(cache: RemoteCache) -> Self {
        Cache::Remote(cache)
    }
}
