//! Session persistence backends.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{SessionData, SessionError};
use crate::cache::Cache;

/// Random bytes in a session token.
const TOKEN_BYTES: usize = 32;

/// Cache key prefix for session records.
const CACHE_KEY_PREFIX: &str = "session:";

/// What a server-side store keeps per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub data: SessionData,
    /// Expiry as seconds since the Unix epoch.
    pub expires_at: u64,
}

impl SessionRecord {
    pub fn new(data: SessionData, lifetime: Duration) -> Self {
        Self {
            data,
            expires_at: unix_now().saturating_add(lifetime.as_secs()),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= unix_now()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Rejects anything that could not have come from [`new_token`], so client
/// input never reaches a backend key unfiltered.
pub(crate) fn is_valid_token(token: &str) -> bool {
    token.len() == URL_SAFE_NO_PAD.encode([0u8; TOKEN_BYTES]).len()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A relational table holding session records, implemented by the application
/// on top of its database connection.
#[async_trait]
pub trait SessionTable: Send + Sync + 'static {
    async fn find(&self, token: &str) -> Result<Option<SessionRecord>, SessionError>;

    async fn commit(&self, token: &str, record: &SessionRecord) -> Result<(), SessionError>;

    async fn delete(&self, token: &str) -> Result<(), SessionError>;
}

/// Session records kept in the cache facade under `session:<token>`.
#[derive(Debug, Clone)]
pub struct CacheSessionStore {
    cache: Cache,
}

impl CacheSessionStore {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    fn key(token: &str) -> String {
        format!("{CACHE_KEY_PREFIX}{token}")
    }

    async fn find(&self, token: &str) -> Result<Option<SessionRecord>, SessionError> {
        match self.cache.get::<SessionRecord>(&Self::key(token)).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, token: &str, record: &SessionRecord) -> Result<(), SessionError> {
        Ok(self.cache.set(&Self::key(token), record).await?)
    }

    async fn delete(&self, token: &str) -> Result<(), SessionError> {
        Ok(self.cache.forget(&Self::key(token)).await?)
    }
}

/// Where session state lives. Chosen once at startup.
#[derive(Clone)]
pub enum SessionStore {
    /// The whole session travels in the cookie; the server keeps nothing.
    Cookie,
    /// Records in an application-provided SQL table.
    Sql(Arc<dyn SessionTable>),
    /// Records in the configured cache backend.
    Cache(CacheSessionStore),
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStore::Cookie => f.write_str("Cookie"),
            SessionStore::Sql(_) => f.write_str("Sql(..)"),
            SessionStore::Cache(store) => f.debug_tuple("Cache").field(store).finish(),
        }
    }
}

impl SessionStore {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionStore::Cookie => "cookie",
            SessionStore::Sql(_) => "sql",
            SessionStore::Cache(_) => "cache",
        }
    }

    /// Looks up a live record; expired records are removed and reported as absent.
    pub(crate) async fn find(&self, token: &str) -> Result<Option<SessionRecord>, SessionError> {
        let found = match self {
            SessionStore::Cookie => return Ok(None),
            SessionStore::Sql(table) => table.find(token).await?,
            SessionStore::Cache(store) => store.find(token).await?,
        };
        match found {
            Some(record) if record.is_expired() => {
                trace!("session record expired");
                self.delete(token).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub(crate) async fn commit(&self, token: &str, record: &SessionRecord) -> Result<(), SessionError> {
        match self {
            SessionStore::Cookie => Ok(()),
            SessionStore::Sql(table) => table.commit(token, record).await,
            SessionStore::Cache(store) => store.commit(token, record).await,
        }
    }

    pub(crate) async fn delete(&self, token: &str) -> Result<(), SessionError> {
        match self {
            SessionStore::Cookie => Ok(()),
            SessionStore::Sql(table) => table.delete(token).await,
            SessionStore::Cache(store) => store.delete(token).await,
        }
    }
}
