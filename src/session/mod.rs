//! Session management on top of the selected persistence backend.
//!
//! Cookie policy comes from the `COOKIE_*` settings. Lifetime is a number of
//! minutes and falls back to 60 when missing or unparsable; the persist and
//! secure flags are on only for a case-insensitive `"true"`.
//!
//! State is kept in exactly one [`SessionStore`]: the cookie itself, an
//! application SQL table, or the cache facade. Cookie-only payloads are
//! signed with [`CookieSigner`] so clients cannot rewrite them.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheError;
use crate::config::CookieSettings;

mod signing;
mod store;

pub use signing::CookieSigner;
pub use store::{CacheSessionStore, SessionRecord, SessionStore, SessionTable};

/// Session lifetime used when `COOKIE_LIFETIME` is absent or unparsable.
pub const DEFAULT_LIFETIME_MINUTES: u64 = 60;

/// Cookie name used when `COOKIE_NAME` is empty.
pub const DEFAULT_COOKIE_NAME: &str = "session";

// Browsers drop cookies beyond roughly this size.
const MAX_COOKIE_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session value could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("session cache backend failed: {0}")]
    Cache(#[from] CacheError),

    #[error("session table failed: {0}")]
    Table(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

impl SameSite {
    pub fn as_str(self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
    }
}

/// Cookie policy for the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub name: String,
    pub lifetime: Duration,
    /// Send `Max-Age` so the cookie survives a browser restart.
    pub persist: bool,
    pub secure: bool,
    pub domain: Option<String>,
    pub same_site: SameSite,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&CookieSettings::default())
    }
}

impl SessionConfig {
    /// Interprets the raw cookie settings. Never fails.
    pub fn from_settings(cookie: &CookieSettings) -> Self {
        let minutes = cookie
            .lifetime
            .trim()
            .parse::<u64>()
            .unwrap_or(DEFAULT_LIFETIME_MINUTES);
        let name = cookie.name.trim();
        let domain = cookie.domain.trim();

        Self {
            name: if name.is_empty() {
                DEFAULT_COOKIE_NAME.to_owned()
            } else {
                name.to_owned()
            },
            lifetime: Duration::from_secs(minutes.saturating_mul(60)),
            persist: flag(&cookie.persist),
            secure: flag(&cookie.secure),
            domain: (!domain.is_empty()).then(|| domain.to_owned()),
            same_site: SameSite::Lax,
        }
    }
}

fn flag(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

/// Key/value state of one session. Values are stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionData {
    values: BTreeMap<String, serde_json::Value>,
}

impl SessionData {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn put<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), SessionError> {
        self.values.insert(key.to_owned(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

/// A loaded session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    token: Option<String>,
    data: SessionData,
}

impl Session {
    /// Server-side token, once the session has been committed to a store.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut SessionData {
        &mut self.data
    }

    pub fn is_new(&self) -> bool {
        self.token.is_none() && self.data.is_empty()
    }
}

/// Loads and commits sessions through the configured store.
#[derive(Debug, Clone)]
pub struct SessionManager {
    config: SessionConfig,
    store: SessionStore,
    signer: CookieSigner,
}

impl SessionManager {
    /// Cookie payloads are signed with a random key until
    /// [`with_signer`](Self::with_signer) installs a stable one.
    pub fn new(config: SessionConfig, store: SessionStore) -> Self {
        debug!(store = store.kind(), cookie = %config.name, "session manager ready");
        Self {
            config,
            store,
            signer: CookieSigner::random(),
        }
    }

    pub fn with_signer(mut self, signer: CookieSigner) -> Self {
        self.signer = signer;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Loads the session named by `cookie` (the session cookie's value).
    ///
    /// A missing, malformed, or expired cookie yields a fresh empty session.
    pub async fn load(&self, cookie: Option<&str>) -> Result<Session, SessionError> {
        let Some(value) = cookie.filter(|v| !v.is_empty()) else {
            return Ok(Session::default());
        };

        if let SessionStore::Cookie = self.store {
            return Ok(self
                .signer
                .verify(value)
                .and_then(decode_cookie_payload)
                .filter(|record| !record.is_expired())
                .map(|record| Session {
                    token: None,
                    data: record.data,
                })
                .unwrap_or_default());
        }

        if !store::is_valid_token(value) {
            debug!("ignoring malformed session token");
            return Ok(Session::default());
        }
        Ok(match self.store.find(value).await? {
            Some(record) => Session {
                token: Some(value.to_owned()),
                data: record.data,
            },
            None => Session::default(),
        })
    }

    /// Persists `session` and returns the `Set-Cookie` header value to send.
    pub async fn commit(&self, session: &mut Session) -> Result<String, SessionError> {
        let record = SessionRecord::new(session.data.clone(), self.config.lifetime);

        let value = match &self.store {
            SessionStore::Cookie => {
                let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&record)?);
                let signed = self.signer.sign(&payload);
                if signed.len() > MAX_COOKIE_BYTES {
                    warn!(bytes = signed.len(), "session cookie exceeds browser size limit");
                }
                signed
            }
            store => {
                let token = session.token.get_or_insert_with(store::new_token).clone();
                store.commit(&token, &record).await?;
                token
            }
        };
        Ok(self.set_cookie(&value))
    }

    /// Deletes the session's server-side record and returns a `Set-Cookie`
    /// header value that clears the cookie.
    pub async fn destroy(&self, session: &mut Session) -> Result<String, SessionError> {
        if let Some(token) = session.token.take() {
            self.store.delete(&token).await?;
        }
        session.data = SessionData::default();
        Ok(self.expired_cookie())
    }

    /// Formats a `Set-Cookie` header value carrying `value`.
    pub fn set_cookie(&self, value: &str) -> String {
        let max_age = self.config.persist.then(|| self.config.lifetime.as_secs());
        self.format_cookie(value, max_age)
    }

    /// Formats a `Set-Cookie` header value that deletes the cookie.
    pub fn expired_cookie(&self) -> String {
        self.format_cookie("", Some(0))
    }

    /// Extracts this manager's cookie from a `Cookie` request header.
    pub fn cookie_value<'a>(&self, header: &'a str) -> Option<&'a str> {
        header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.config.name)
            .map(|(_, value)| value.trim())
    }

    fn format_cookie(&self, value: &str, max_age: Option<u64>) -> String {
        let mut cookie = format!("{}={}; Path=/", self.config.name, value);
        if let Some(domain) = &self.config.domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        if let Some(secs) = max_age {
            cookie.push_str(&format!("; Max-Age={secs}"));
        }
        cookie.push_str("; HttpOnly");
        if self.config.secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str("; SameSite=");
        cookie.push_str(self.config.same_site.as_str());
        cookie
    }
}

fn decode_cookie_payload(value: &str) -> Option<SessionRecord> {
    let bytes = URL_SAFE_NO_PAD.decode(value).ok()?;
    serde_json::from_slice(&bytes).ok()
}
