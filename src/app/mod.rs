//! Startup wiring: picks the cache backend and the session store from
//! [`Config`] and owns their shutdown.
//!
//! ```rust,no_run
//! use cellar::app::AppBuilder;
//! use cellar::config::Config;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env(".")?;
//! let app = AppBuilder::new(config).build().await?;
//! app.cache()?.set("greeting", &"hello").await?;
//! app.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::background::Maintenance;
use crate::cache::{Cache, CacheError, EmbeddedCache, RemoteCache};
use crate::config::{CacheKind, Config, SessionKind};
use crate::pool::{Pool, PoolError, RedisManager};
use crate::session::{
    CacheSessionStore, CookieSigner, SessionConfig, SessionManager, SessionStore, SessionTable,
};
use crate::store::{Store, StoreError, StoreOptions};

/// Errors that stop the application from starting.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to open embedded store: {0}")]
    Store(#[from] StoreError),

    #[error("cache backend at {host} is unavailable: {source}")]
    BackendUnavailable {
        host: String,
        #[source]
        source: PoolError,
    },

    #[error("SESSION_TYPE wants the {wanted:?} cache but CACHE selects {configured:?}")]
    SessionBackend {
        wanted: CacheKind,
        configured: CacheKind,
    },

    #[error("SQL sessions need a session table; pass one with AppBuilder::session_table")]
    MissingSessionTable,

    #[error("startup task failed: {0}")]
    Blocking(#[from] JoinError),
}

/// The cache backend chosen at startup.
pub enum CacheBackend {
    None,
    Embedded {
        store: Store,
        maintenance: Maintenance,
    },
    Remote(Pool<RedisManager>),
}

impl CacheBackend {
    pub fn kind(&self) -> CacheKind {
        match self {
            CacheBackend::None => CacheKind::None,
            CacheBackend::Embedded { .. } => CacheKind::Embedded,
            CacheBackend::Remote(_) => CacheKind::Remote,
        }
    }
}

impl fmt::Debug for CacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheBackend::None => f.write_str("None"),
            CacheBackend::Embedded { store, .. } => {
                f.debug_struct("Embedded").field("dir", &store.dir()).finish()
            }
            CacheBackend::Remote(pool) => f
                .debug_tuple("Remote")
                .field(&pool.manager().host())
                .finish(),
        }
    }
}

/// Builds an [`App`] from configuration.
pub struct AppBuilder {
    config: Config,
    session_table: Option<Arc<dyn SessionTable>>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            session_table: None,
        }
    }

    /// Table used when `SESSION_TYPE` selects SQL storage.
    pub fn session_table(mut self, table: Arc<dyn SessionTable>) -> Self {
        self.session_table = Some(table);
        self
    }

    /// Opens the configured backends.
    ///
    /// The cache is wired first, then the session store. A remote backend is
    /// dialed once here so a bad host or password fails startup.
    pub async fn build(self) -> Result<App, SetupError> {
        let AppBuilder {
            config,
            session_table,
        } = self;

        let backend = match config.cache {
            CacheKind::None => CacheBackend::None,
            CacheKind::Embedded => {
                let dir = config.store_dir();
                let store =
                    tokio::task::spawn_blocking(move || Store::open(StoreOptions::new(dir))).await??;
                let maintenance = Maintenance::spawn(store.clone(), config.maintenance.clone());
                CacheBackend::Embedded { store, maintenance }
            }
            CacheKind::Remote => {
                let manager = RedisManager::new(&config.redis.host, config.redis.password.clone());
                let pool = Pool::new(manager, config.pool.clone());
                if let Err(source) = pool.get().await {
                    pool.close();
                    return Err(SetupError::BackendUnavailable {
                        host: config.redis.host.clone(),
                        source,
                    });
                }
                CacheBackend::Remote(pool)
            }
        };

        let cache = match &backend {
            CacheBackend::None => None,
            CacheBackend::Embedded { store, .. } => {
                Some(Cache::from(EmbeddedCache::new(store.clone(), &config.redis.prefix)))
            }
            CacheBackend::Remote(pool) => {
                Some(Cache::from(RemoteCache::new(pool.clone(), &config.redis.prefix)))
            }
        };

        let store = match (config.session, &cache) {
            (SessionKind::Cookie, _) => Ok(SessionStore::Cookie),
            (SessionKind::Sql, _) => session_table
                .map(SessionStore::Sql)
                .ok_or(SetupError::MissingSessionTable),
            (SessionKind::Cache(wanted), Some(cache)) if wanted == backend.kind() => {
                Ok(SessionStore::Cache(CacheSessionStore::new(cache.clone())))
            }
            (SessionKind::Cache(wanted), _) => Err(SetupError::SessionBackend {
                wanted,
                configured: backend.kind(),
            }),
        };
        let store = match store {
            Ok(store) => store,
            Err(e) => {
                close_backend(&backend).await;
                return Err(e);
            }
        };

        let signer = if config.cookie.key.is_empty() {
            if matches!(store, SessionStore::Cookie) {
                warn!("KEY is not set; cookie sessions will not survive a restart");
            }
            CookieSigner::random()
        } else {
            CookieSigner::new(&config.cookie.key)
        };
        let sessions = SessionManager::new(SessionConfig::from_settings(&config.cookie), store)
            .with_signer(signer);
        info!(cache = ?backend.kind(), sessions = sessions.store().kind(), "application wired");

        Ok(App {
            config,
            backend,
            cache,
            sessions,
            closed: AtomicBool::new(false),
        })
    }
}

/// Backends and session wiring shared by every request handler.
#[derive(Debug)]
pub struct App {
    config: Config,
    backend: CacheBackend,
    cache: Option<Cache>,
    sessions: SessionManager,
    closed: AtomicBool,
}

impl App {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &CacheBackend {
        &self.backend
    }

    /// The cache facade, or [`CacheError::NotConfigured`] when `CACHE` is empty.
    pub fn cache(&self) -> Result<&Cache, CacheError> {
        self.cache.as_ref().ok_or(CacheError::NotConfigured)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Stops maintenance, then closes the store or pool. Later calls do nothing.
    ///
    /// Call after the server has stopped accepting requests.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("shutdown already done");
            return;
        }
        close_backend(&self.backend).await;
        info!("backends closed");
    }
}

async fn close_backend(backend: &CacheBackend) {
    match backend {
        CacheBackend::None => {}
        CacheBackend::Embedded { store, maintenance } => {
            maintenance.stop().await;
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "failed to close embedded store"),
                Err(e) => warn!(error = %e, "store close task failed"),
            }
        }
        CacheBackend::Remote(pool) => pool.close(),
    }
}
