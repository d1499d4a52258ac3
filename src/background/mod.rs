//! Background maintenance for the embedded store.
//!
//! [`Maintenance::spawn`] starts a task that wakes every
//! [`MaintenanceConfig::interval`] and reclaims space with
//! [`Store::run_gc`]. A failed pass is logged and retried on the next tick.
//! The task stops when [`Maintenance::stop`] is called, which the
//! application does before closing the store.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lock;
use crate::store::{GcOutcome, Store, StoreError};

/// Default time between maintenance passes (12 hours).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Default stale fraction a segment needs before it is rewritten.
pub const DEFAULT_DISCARD_RATIO: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    /// Time between passes. Zero disables the scheduler.
    pub interval: Duration,
    pub discard_ratio: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            discard_ratio: DEFAULT_DISCARD_RATIO,
        }
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("maintenance pass failed: {0}")]
    Store(#[from] StoreError),

    #[error("maintenance task panicked or was cancelled: {0}")]
    Join(#[from] JoinError),
}

/// What one pass accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub segments_rewritten: usize,
    pub reclaimed_bytes: u64,
}

/// Runs one maintenance pass: rewrites segments until none qualifies.
///
/// The pass runs on the blocking thread pool. It stops after as many rewrites
/// as there were segments when it started, so carried-forward records cannot
/// keep it spinning.
pub async fn run_pass(store: &Store, discard_ratio: f64) -> Result<PassReport, MaintenanceError> {
    let store = store.clone();
    let report = tokio::task::spawn_blocking(move || -> Result<PassReport, StoreError> {
        let mut report = PassReport::default();
        let budget = store.stats().segments;

        for _ in 0..budget {
            match store.run_gc(discard_ratio)? {
                GcOutcome::Rewritten { reclaimed_bytes, .. } => {
                    report.segments_rewritten += 1;
                    report.reclaimed_bytes += reclaimed_bytes;
                }
                GcOutcome::NoRewrite => break,
            }
        }
        Ok(report)
    })
    .await??;
    Ok(report)
}

/// Handle to the running maintenance task.
#[derive(Debug)]
pub struct Maintenance {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Maintenance {
    /// Starts the periodic task. The first pass runs one interval after start.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(store: Store, config: MaintenanceConfig) -> Self {
        let token = CancellationToken::new();

        if config.interval.is_zero() {
            debug!("store maintenance disabled");
            return Self {
                token,
                handle: Mutex::new(None),
            };
        }

        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?config.interval, ratio = config.discard_ratio, "store maintenance started");

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                match run_pass(&store, config.discard_ratio).await {
                    Ok(report) if report.segments_rewritten > 0 => info!(
                        segments = report.segments_rewritten,
                        reclaimed_bytes = report.reclaimed_bytes,
                        "store maintenance pass finished"
                    ),
                    Ok(_) => debug!("store maintenance pass found nothing to reclaim"),
                    Err(e) => warn!(error = %e, "store maintenance pass failed, retrying next tick"),
                }
            }
            debug!("store maintenance stopped");
        });

        Self {
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signals the task to stop and waits for it to exit.
    ///
    /// A pass already in progress is allowed to finish. Calling `stop` again
    /// returns immediately.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = lock::lock(&self.handle, "maintenance.stop").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "store maintenance task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock::lock(&self.handle, "maintenance.is_running")
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
