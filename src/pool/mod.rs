//! Bounded connection pool for the remote cache backend.
//!
//! The pool lends out exclusively-owned connections through the [`Pooled`]
//! guard and takes them back when the guard drops. At most
//! [`PoolConfig::max_active`] connections are outstanding at once; callers
//! beyond that wait, for at most [`PoolConfig::wait_timeout`], for a slot.
//!
//! Idle connections are probed with [`Manager::probe`] before being lent out.
//! A connection that fails the probe is dropped and a fresh one is dialed in
//! its place, so a restarted backend only costs the caller some latency.
//!
//! Only the idle-list bookkeeping happens under a lock; the command exchange on
//! a borrowed connection never does.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::lock;

pub mod redis;

pub use redis::{Connection, ConnectionError, RedisManager};

/// Default number of idle connections kept for reuse.
pub const DEFAULT_MAX_IDLE: usize = 50;

/// Default ceiling on simultaneously borrowed connections.
pub const DEFAULT_MAX_ACTIVE: usize = 100;

/// Default time an idle connection may sit unused before it is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(240);

/// Default bound on how long `get` waits for a free slot.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates and health-checks the connections a [`Pool`] hands out.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// The connection type being pooled.
    type Connection: Send + 'static;

    /// Error produced when dialing or probing fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Dials a brand new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Performs a cheap round trip to confirm `conn` is still usable.
    async fn probe(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;
}

/// Sizing and timing knobs for a [`Pool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of idle connections retained after release.
    pub max_idle: usize,
    /// Maximum number of connections borrowed at the same time.
    pub max_active: usize,
    /// Idle connections unused for longer than this are closed.
    pub idle_timeout: Duration,
    /// How long [`Pool::get`] waits for a slot before giving up.
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            max_active: DEFAULT_MAX_ACTIVE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// Errors returned by [`Pool::get`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a free connection")]
    Timeout(Duration),

    #[error("connection pool is closed")]
    Closed,

    #[error("failed to dial backend: {0}")]
    Dial(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections parked in the idle list.
    pub idle: usize,
    /// Connections currently lent out.
    pub in_use: usize,
    /// The configured `max_active` ceiling.
    pub max_active: usize,
}

struct IdleConn<C> {
    conn: C,
    since: Instant,
}

struct PoolInner<M: Manager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn<M::Connection>>>,
    slots: Arc<Semaphore>,
    in_use: AtomicUsize,
    closed: AtomicBool,
}

/// A bounded, health-checked pool of connections.
///
/// Cloning a `Pool` is cheap and yields another handle to the same pool.
pub struct Pool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Manager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl<M: Manager> Pool<M> {
    /// Creates an empty pool. No connection is dialed until the first [`get`](Self::get).
    ///
    /// A `max_active` of zero is treated as one.
    pub fn new(manager: M, mut config: PoolConfig) -> Self {
        config.max_active = config.max_active.max(1);
        let slots = Arc::new(Semaphore::new(config.max_active));
        Self {
            inner: Arc::new(PoolInner {
                manager,
                idle: Mutex::new(VecDeque::with_capacity(config.max_idle.min(64))),
                slots,
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns the connection manager.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Borrows a connection, dialing a new one if no healthy idle connection exists.
    ///
    /// This may wait (up to `wait_timeout`) when `max_active` connections are
    /// already lent out.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Timeout`]: no slot freed up in time.
    /// - [`PoolError::Closed`]: the pool was closed.
    /// - [`PoolError::Dial`]: a new connection was needed and dialing failed.
    pub async fn get(&self) -> Result<Pooled<M>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let wait = self.inner.config.wait_timeout;
        let permit = match tokio::time::timeout(wait, Arc::clone(&self.inner.slots).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                debug!(wait = ?wait, "connection pool exhausted");
                return Err(PoolError::Timeout(wait));
            }
        };

        while let Some(mut conn) = self.pop_idle() {
            match self.inner.manager.probe(&mut conn).await {
                Ok(()) => {
                    trace!("reusing idle connection");
                    return Ok(self.lend(conn, permit));
                }
                Err(e) => {
                    debug!(error = %e, "idle connection failed liveness probe, discarding");
                }
            }
        }

        let conn = self.inner.manager.connect().await.map_err(|e| {
            warn!(error = %e, "failed to dial backend connection");
            PoolError::Dial(Box::new(e))
        })?;
        debug!("dialed new backend connection");
        Ok(self.lend(conn, permit))
    }

    /// Returns current idle / in-use counts.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            idle: lock::lock(&self.inner.idle, "pool.status").len(),
            in_use: self.inner.in_use.load(Ordering::Acquire),
            max_active: self.inner.config.max_active,
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes the pool: idle connections are dropped, waiters fail with
    /// [`PoolError::Closed`], and borrowed connections are dropped on return.
    ///
    /// Calling `close` again is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.slots.close();
        let drained = {
            let mut idle = lock::lock(&self.inner.idle, "pool.close");
            idle.drain(..).count()
        };
        debug!(closed_idle = drained, "connection pool closed");
    }

    // Pops the most recently returned idle connection, discarding any that
    // have outlived the idle timeout.
    fn pop_idle(&self) -> Option<M::Connection> {
        let timeout = self.inner.config.idle_timeout;
        let mut idle = lock::lock(&self.inner.idle, "pool.pop_idle");

        while let Some(oldest) = idle.back() {
            if oldest.since.elapsed() < timeout {
                break;
            }
            idle.pop_back();
            trace!("closed connection past idle timeout");
        }

        idle.pop_front().map(|entry| entry.conn)
    }

    fn lend(&self, conn: M::Connection, permit: OwnedSemaphorePermit) -> Pooled<M> {
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        Pooled {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            broken: false,
            _permit: permit,
        }
    }
}

/// A connection borrowed from a [`Pool`].
///
/// Dereferences to the underlying connection. Dropping the guard returns the
/// connection to the idle list (unless it was marked broken or the pool is
/// closed) and frees its slot.
pub struct Pooled<M: Manager> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    broken: bool,
    // Dropped after `Drop::drop` runs, so the connection is back in the idle
    // list before a waiter can take the slot.
    _permit: OwnedSemaphorePermit,
}

impl<M: Manager> Pooled<M> {
    /// Marks the connection as unusable so it is closed instead of being reused.
    pub fn discard(&mut self) {
        self.broken = true;
    }

    /// Clears an earlier [`discard`](Self::discard).
    ///
    /// Callers mark the connection broken before an exchange and clear the
    /// mark once the reply is read, so an exchange abandoned halfway never
    /// goes back to the idle list.
    pub fn retain(&mut self) {
        self.broken = false;
    }
}

impl<M: Manager> fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<M: Manager> Deref for Pooled<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection is present until drop"))
    }
}

impl<M: Manager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("connection is present until drop"))
    }
}

impl<M: Manager> Drop for Pooled<M> {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);

        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken || self.pool.closed.load(Ordering::Acquire) {
            trace!("dropping connection on release");
            return;
        }

        let mut idle = lock::lock(&self.pool.idle, "pool.release");
        idle.push_front(IdleConn {
            conn,
            since: Instant::now(),
        });
        while idle.len() > self.pool.config.max_idle {
            idle.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[derive(Debug, Error)]
    #[error("fake failure")]
    struct FakeError;

    struct FakeConn {
        id: u32,
        alive: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct FakeManager {
        dialed: AtomicU32,
        probed: AtomicU32,
        refuse: AtomicBool,
        handles: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FakeManager {
        fn kill_all(&self) {
            for alive in self.handles.lock().unwrap().iter() {
                alive.store(false, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl Manager for FakeManager {
        type Connection = FakeConn;
        type Error = FakeError;

        async fn connect(&self) -> Result<FakeConn, FakeError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(FakeError);
            }
            let id = self.dialed.fetch_add(1, Ordering::SeqCst) + 1;
            let alive = Arc::new(AtomicBool::new(true));
            self.handles.lock().unwrap().push(Arc::clone(&alive));
            Ok(FakeConn { id, alive })
        }

        async fn probe(&self, conn: &mut FakeConn) -> Result<(), FakeError> {
            self.probed.fetch_add(1, Ordering::SeqCst);
            if conn.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(FakeError)
            }
        }
    }

    fn config(max_idle: usize, max_active: usize) -> PoolConfig {
        PoolConfig {
            max_idle,
            max_active,
            idle_timeout: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let pool = Pool::new(FakeManager::default(), config(4, 4));

        let first = pool.get().await.unwrap();
        let first_id = first.id;
        drop(first);

        let second = pool.get().await.unwrap();
        assert_eq!(second.id, first_id);
        assert_eq!(pool.manager().dialed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.manager().probed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_idle_connection_is_replaced_transparently() {
        let pool = Pool::new(FakeManager::default(), config(4, 4));

        drop(pool.get().await.unwrap());
        pool.manager().kill_all();

        let conn = pool.get().await.expect("fresh connection replaces the dead one");
        assert_eq!(conn.id, 2);
        assert!(conn.alive.load(Ordering::SeqCst));
        assert_eq!(pool.manager().dialed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn borrowed_connections_never_exceed_max_active() {
        let pool = Pool::new(FakeManager::default(), config(2, 3));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let pool = pool.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _conn = pool.get().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.status().in_use, 0);
        assert!(pool.status().idle <= 2);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let mut cfg = config(1, 1);
        cfg.wait_timeout = Duration::from_millis(20);
        let pool = Pool::new(FakeManager::default(), cfg);

        let _held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
    }

    #[tokio::test]
    async fn waiter_is_served_when_a_connection_is_released() {
        let pool = Pool::new(FakeManager::default(), config(1, 1));
        let held = pool.get().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|c| c.id) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn idle_list_is_capped_at_max_idle() {
        let pool = Pool::new(FakeManager::default(), config(2, 8));

        let conns: Vec<_> = futures_join(&pool, 5).await;
        assert_eq!(pool.status().in_use, 5);
        drop(conns);

        let status = pool.status();
        assert_eq!(status.idle, 2);
        assert_eq!(status.in_use, 0);
    }

    async fn futures_join(pool: &Pool<FakeManager>, n: usize) -> Vec<Pooled<FakeManager>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(pool.get().await.unwrap());
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_expire_after_idle_timeout() {
        let mut cfg = config(4, 4);
        cfg.idle_timeout = Duration::from_secs(30);
        let pool = Pool::new(FakeManager::default(), cfg);

        drop(pool.get().await.unwrap());
        tokio::time::advance(Duration::from_secs(31)).await;

        let conn = pool.get().await.unwrap();
        assert_eq!(conn.id, 2);
        // The expired connection was closed without being probed.
        assert_eq!(pool.manager().probed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broken_connection_is_not_returned() {
        let pool = Pool::new(FakeManager::default(), config(4, 4));

        let mut conn = pool.get().await.unwrap();
        conn.discard();
        drop(conn);

        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn retained_connection_goes_back_to_idle() {
        let pool = Pool::new(FakeManager::default(), config(4, 4));

        let mut conn = pool.get().await.unwrap();
        conn.discard();
        conn.retain();
        drop(conn);

        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn failed_get_can_be_unwrapped_for_its_error() {
        let pool = Pool::new(FakeManager::default(), config(1, 1));
        let mut held = pool.get().await.unwrap();
        held.discard();
        assert_eq!(format!("{held:?}"), "Pooled { broken: true, .. }");

        pool.manager().refuse.store(true, Ordering::SeqCst);
        drop(held);
        assert!(matches!(pool.get().await.unwrap_err(), PoolError::Dial(_)));
    }

    #[tokio::test]
    async fn dial_failure_frees_the_slot() {
        let pool = Pool::new(FakeManager::default(), config(1, 1));
        pool.manager().refuse.store(true, Ordering::SeqCst);

        assert!(matches!(pool.get().await, Err(PoolError::Dial(_))));

        pool.manager().refuse.store(false, Ordering::SeqCst);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_borrowers() {
        let pool = Pool::new(FakeManager::default(), config(4, 4));
        let held = pool.get().await.unwrap();

        pool.close();
        pool.close();

        assert!(matches!(pool.get().await, Err(PoolError::Closed)));
        drop(held);
        assert_eq!(pool.status().idle, 0);
    }
}
