//! Periodic maintenance: lease reaping and delayed-job promotion.
//!
//! Each tick:
//!
//! 1. `processing` rows whose lease expired go back to `pending` (or to
//!    `failed` once attempts are exhausted)
//! 2. in accelerated mode, eligible `pending` rows that never reached the
//!    dispatch list are requeued
//!
//! Step 2 also repairs pushes lost to accelerator outages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use crate::config::{DEFAULT_LEASE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use crate::queue::{JobQueue, QueueError};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// How long a row may stay `processing` before it is reaped
    pub lease_timeout: Duration,
    /// Rows handled per step per tick
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            batch_size: 500,
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reaped: usize,
    pub exhausted: usize,
    pub promoted: usize,
}

pub struct Sweeper<S: JobStore> {
    queue: Arc<JobQueue<S>>,
    config: SweeperConfig,
}

impl<S: JobStore + 'static> Sweeper<S> {
    pub fn new(queue: Arc<JobQueue<S>>, config: SweeperConfig) -> Self {
        Self { queue, config }
    }

    /// Run one sweep.
    pub async fn tick(&self) -> Result<SweepReport, QueueError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.lease_timeout).unwrap_or_default();
        let store = self.queue.store();

        let reaped = store
            .reap_stale(now - lease, now, self.config.batch_size)
            .await?;
        if !reaped.failed.is_empty() {
            warn!(count = reaped.failed.len(), "jobs failed after lease expiry");
        }

        let mut report = SweepReport {
            reaped: reaped.requeued.len(),
            exhausted: reaped.failed.len(),
            promoted: 0,
        };

        if self.queue.backend().is_accelerated() {
            let due = store.due_undispatched(now, self.config.batch_size).await?;
            if !due.is_empty() {
                self.queue.requeue(&due).await;
                report.promoted = due.len();
            }
        }

        if report != SweepReport::default() {
            info!(
                reaped = report.reaped,
                exhausted = report.exhausted,
                promoted = report.promoted,
                "sweep completed"
            );
        } else {
            debug!("sweep found nothing to do");
        }
        Ok(report)
    }

    /// Run `tick` every interval until the handle is shut down.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(interval_ms = self.config.interval.as_millis() as u64, "job sweeper started");
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!(error = %e, "job sweep failed");
                        }
                    }
                }
            }
            info!("job sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "job sweeper task failed");
        }
    }
}
