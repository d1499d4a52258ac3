//! Startup configuration read from environment-style key/value pairs.
//!
//! [`Config::from_env`] reads the process environment, falling back to a
//! `.env` file in the application root. [`Config::from_lookup`] takes any
//! lookup function, which is what the tests use.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::background::MaintenanceConfig;
use crate::pool::PoolConfig;

/// Port the demo server listens on when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 4000;

/// Errors produced while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown cache backend {0:?} (expected redis, badger, or empty)")]
    UnknownCache(String),

    #[error("{key} must be a number, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key} must be strictly between 0 and 1, got {value}")]
    OutOfRange { key: &'static str, value: f64 },

    #[error("{key} is required when {reason}")]
    Missing { key: &'static str, reason: &'static str },

    #[error("failed to read {path}: {source}")]
    DotEnv {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },
}

/// Which cache backend to wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    None,
    Embedded,
    Remote,
}

impl FromStr for CacheKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(CacheKind::None),
            "badger" | "embedded" => Ok(CacheKind::Embedded),
            "redis" | "remote" => Ok(CacheKind::Remote),
            _ => Err(ConfigError::UnknownCache(s.to_owned())),
        }
    }
}

/// Which session persistence backend to wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Cookie,
    Sql,
    Cache(CacheKind),
}

impl SessionKind {
    /// Parses `SESSION_TYPE`. Unknown values fall back to cookie-only storage.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "cookie" => SessionKind::Cookie,
            "redis" | "remote" => SessionKind::Cache(CacheKind::Remote),
            "badger" | "embedded" => SessionKind::Cache(CacheKind::Embedded),
            "mysql" | "mariadb" | "postgres" | "postgresql" => SessionKind::Sql,
            other => {
                warn!(session_type = other, "unknown SESSION_TYPE, using cookie sessions");
                SessionKind::Cookie
            }
        }
    }
}

/// Dial parameters and key namespace for the remote backend.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub password: Option<String>,
    pub prefix: String,
}

impl std::fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSettings")
            .field("host", &self.host)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Raw cookie policy strings, interpreted by [`crate::session::SessionConfig`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CookieSettings {
    pub name: String,
    pub lifetime: String,
    pub persist: String,
    pub secure: String,
    pub domain: String,
    /// Signing key for cookie-only sessions (`KEY`).
    pub key: String,
}

impl std::fmt::Debug for CookieSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSettings")
            .field("name", &self.name)
            .field("lifetime", &self.lifetime)
            .field("persist", &self.persist)
            .field("secure", &self.secure)
            .field("domain", &self.domain)
            .field("key", &(!self.key.is_empty()).then_some("***"))
            .finish()
    }
}

/// Everything the backend selector needs at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub cache: CacheKind,
    pub session: SessionKind,
    pub redis: RedisSettings,
    pub pool: PoolConfig,
    pub maintenance: MaintenanceConfig,
    pub cookie: CookieSettings,
    pub port: u16,
}

impl Config {
    /// Reads configuration from the process environment and `<root>/.env`.
    ///
    /// Variables already set in the environment take precedence over the file.
    pub fn from_env(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        load_dotenv(&root.join(".env"))?;
        Self::from_lookup(root, |key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(root: impl Into<PathBuf>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).unwrap_or_default();

        let cache: CacheKind = get("CACHE").parse()?;
        let session = SessionKind::parse(&get("SESSION_TYPE"));

        let redis = RedisSettings {
            host: get("REDIS_HOST"),
            password: Some(get("REDIS_PASSWORD")).filter(|p| !p.is_empty()),
            prefix: get("REDIS_PREFIX"),
        };
        let needs_remote =
            cache == CacheKind::Remote || session == SessionKind::Cache(CacheKind::Remote);
        if needs_remote && redis.host.is_empty() {
            return Err(ConfigError::Missing {
                key: "REDIS_HOST",
                reason: "the redis backend is selected",
            });
        }

        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            max_idle: number(&lookup, "REDIS_MAX_IDLE")?.unwrap_or(defaults.max_idle),
            max_active: number(&lookup, "REDIS_MAX_ACTIVE")?.unwrap_or(defaults.max_active),
            idle_timeout: seconds(&lookup, "REDIS_IDLE_TIMEOUT")?.unwrap_or(defaults.idle_timeout),
            wait_timeout: seconds(&lookup, "REDIS_WAIT_TIMEOUT")?.unwrap_or(defaults.wait_timeout),
        };

        let gc_defaults = MaintenanceConfig::default();
        let discard_ratio = number(&lookup, "CACHE_GC_DISCARD_RATIO")?.unwrap_or(gc_defaults.discard_ratio);
        if !(discard_ratio > 0.0 && discard_ratio < 1.0) {
            return Err(ConfigError::OutOfRange {
                key: "CACHE_GC_DISCARD_RATIO",
                value: discard_ratio,
            });
        }
        let maintenance = MaintenanceConfig {
            interval: seconds(&lookup, "CACHE_GC_INTERVAL")?.unwrap_or(gc_defaults.interval),
            discard_ratio,
        };

        let cookie = CookieSettings {
            name: get("COOKIE_NAME"),
            lifetime: get("COOKIE_LIFETIME"),
            persist: get("COOKIE_PERSIST"),
            secure: get("COOKIE_SECURE"),
            domain: get("COOKIE_DOMAIN"),
            key: get("KEY"),
        };

        let port = number(&lookup, "PORT")?.unwrap_or(DEFAULT_PORT);

        let config = Self {
            root: root.into(),
            cache,
            session,
            redis,
            pool,
            maintenance,
            cookie,
            port,
        };
        debug!(cache = ?config.cache, session = ?config.session, "configuration loaded");
        Ok(config)
    }

    /// Directory the embedded store lives in.
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("tmp").join("kvstore")
    }
}

// Loads `path` into the process environment; variables that are already set
// are left alone. A missing file is not an error.
fn load_dotenv(path: &Path) -> Result<bool, ConfigError> {
    if !path.is_file() {
        return Ok(false);
    }
    dotenv::from_path(path).map_err(|source| ConfigError::DotEnv {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "loaded .env file");
    Ok(true)
}

fn number<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_owned()) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value: v }),
    }
}

fn seconds<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(number::<u64, F>(lookup, key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup("/srv/app", move |key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.cache, CacheKind::None);
        assert_eq!(cfg.session, SessionKind::Cookie);
        assert_eq!(cfg.pool, PoolConfig::default());
        assert_eq!(cfg.maintenance.interval, Duration::from_secs(12 * 60 * 60));
        assert_eq!(cfg.maintenance.discard_ratio, 0.7);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.store_dir(), PathBuf::from("/srv/app/tmp/kvstore"));
    }

    #[test]
    fn cache_kinds_are_case_insensitive() {
        assert_eq!("Redis".parse::<CacheKind>().unwrap(), CacheKind::Remote);
        assert_eq!("BADGER".parse::<CacheKind>().unwrap(), CacheKind::Embedded);
        assert_eq!("embedded".parse::<CacheKind>().unwrap(), CacheKind::Embedded);
        assert!(matches!(
            "memcached".parse::<CacheKind>(),
            Err(ConfigError::UnknownCache(_))
        ));
    }

    #[test]
    fn session_types() {
        assert_eq!(SessionKind::parse("redis"), SessionKind::Cache(CacheKind::Remote));
        assert_eq!(SessionKind::parse("badger"), SessionKind::Cache(CacheKind::Embedded));
        assert_eq!(SessionKind::parse("MariaDB"), SessionKind::Sql);
        assert_eq!(SessionKind::parse("postgresql"), SessionKind::Sql);
        assert_eq!(SessionKind::parse("carrier-pigeon"), SessionKind::Cookie);
    }

    #[test]
    fn remote_settings_and_tuning() {
        let cfg = config(&[
            ("CACHE", "redis"),
            ("REDIS_HOST", "127.0.0.1:6379"),
            ("REDIS_PASSWORD", ""),
            ("REDIS_PREFIX", "app1"),
            ("REDIS_MAX_ACTIVE", "8"),
            ("REDIS_WAIT_TIMEOUT", "2"),
            ("CACHE_GC_DISCARD_RATIO", "0.5"),
            ("PORT", "8080"),
        ])
        .unwrap();

        assert_eq!(cfg.cache, CacheKind::Remote);
        assert_eq!(cfg.redis.host, "127.0.0.1:6379");
        assert_eq!(cfg.redis.password, None);
        assert_eq!(cfg.redis.prefix, "app1");
        assert_eq!(cfg.pool.max_active, 8);
        assert_eq!(cfg.pool.max_idle, 50);
        assert_eq!(cfg.pool.wait_timeout, Duration::from_secs(2));
        assert_eq!(cfg.maintenance.discard_ratio, 0.5);
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn remote_backend_requires_a_host() {
        let err = config(&[("SESSION_TYPE", "redis")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "REDIS_HOST", .. }));
    }

    #[test]
    fn malformed_tuning_value_is_an_error() {
        let err = config(&[("REDIS_MAX_IDLE", "lots")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber { key: "REDIS_MAX_IDLE", .. }
        ));
    }

    #[test]
    fn discard_ratio_must_be_a_fraction() {
        for bad in ["1.5", "0", "1", "-0.2", "NaN"] {
            let err = config(&[("CACHE", "badger"), ("CACHE_GC_DISCARD_RATIO", bad)]).unwrap_err();
            assert!(
                matches!(err, ConfigError::OutOfRange { key: "CACHE_GC_DISCARD_RATIO", .. }),
                "{bad} was accepted"
            );
        }
        let cfg = config(&[("CACHE_GC_DISCARD_RATIO", "0.25")]).unwrap();
        assert_eq!(cfg.maintenance.discard_ratio, 0.25);
    }

    #[test]
    fn cookie_strings_are_passed_through_raw() {
        let cfg = config(&[("COOKIE_LIFETIME", "soon"), ("COOKIE_SECURE", "TRUE")]).unwrap();
        assert_eq!(cfg.cookie.lifetime, "soon");
        assert_eq!(cfg.cookie.secure, "TRUE");
    }

    #[test]
    fn signing_key_is_read_but_not_printed() {
        let cfg = config(&[("KEY", "a-very-secret-signing-key")]).unwrap();
        assert_eq!(cfg.cookie.key, "a-very-secret-signing-key");
        assert!(!format!("{cfg:?}").contains("a-very-secret-signing-key"));
    }

    #[test]
    fn dotenv_file_fills_in_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "CELLAR_DOTENV_ONLY_KEY=from_file\n",
        )
        .unwrap();

        assert!(load_dotenv(&dir.path().join(".env")).unwrap());
        assert_eq!(std::env::var("CELLAR_DOTENV_ONLY_KEY").unwrap(), "from_file");
        assert!(!load_dotenv(&dir.path().join("missing.env")).unwrap());
    }
}
