//! Reference worker: dequeues ids, claims rows, runs handlers, writes back.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobStatus, JobType, RetryPolicy};
use crate::queue::{Backend, JobQueue, QueueError};

/// What a handler reports back for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    /// Retry with the executor's backoff until attempts are exhausted.
    Failure(String),
    /// Retry no earlier than the given delay.
    RetryAfter(Duration),
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;

/// Async job handler.
pub type JobHandler = Arc<dyn Fn(Job) -> HandlerFuture + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How long to sleep when the queue is empty
    pub poll_interval: Duration,
    /// Ids requested per dequeue
    pub batch_size: usize,
    /// Name for logging
    pub name: String,
    pub retry_policy: RetryPolicy,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
            name: "job-executor".to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    /// Popped ids whose row was no longer pending.
    pub jobs_skipped: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the current batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "job executor task failed");
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Background job executor.
///
/// In accelerated mode popped ids are claimed with [`JobStore::start`], so a
/// duplicate list entry runs at most once. In store-direct mode dequeue has
/// already claimed the row.
pub struct JobExecutor<S: JobStore> {
    queue: Arc<JobQueue<S>>,
    handlers: HashMap<JobType, JobHandler>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(queue: Arc<JobQueue<S>>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    /// Register the handler for a job type, replacing any previous one.
    pub fn register_handler<F, Fut>(&mut self, job_type: JobType, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        self.handlers
            .insert(job_type, Arc::new(move |job| Box::pin(handler(job)) as HandlerFuture));
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Dequeue one batch and run it. Returns how many ids were dequeued.
    pub async fn run_once(&self, config: &JobExecutorConfig) -> Result<usize, QueueError> {
        let ids = self.queue.dequeue(config.batch_size).await?;
        for id in &ids {
            if let Err(e) = self.execute(*id, config).await {
                error!(executor = %config.name, job_id = %id, error = %e, "job write-back failed");
            }
        }
        Ok(ids.len())
    }

    async fn claim(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let store = self.queue.store();
        match self.queue.backend() {
            Backend::Accelerated(_) => store.start(id, Utc::now()).await,
            Backend::StoreDirect => Ok(store
                .get(id)
                .await?
                .filter(|job| job.status == JobStatus::Processing)),
        }
    }

    async fn execute(&self, id: JobId, config: &JobExecutorConfig) -> Result<(), JobStoreError> {
        let Some(job) = self.claim(id).await? else {
            debug!(executor = %config.name, job_id = %id, "job not pending or not yet due, skipped");
            self.bump(|s| s.jobs_skipped += 1);
            return Ok(());
        };

        debug!(
            executor = %config.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            "claimed job"
        );

        let outcome = match self.handlers.get(&job.job_type) {
            Some(handler) => {
                // A panicking handler fails the job instead of the executor.
                match tokio::spawn(handler(job.clone())).await {
                    Ok(outcome) => outcome,
                    Err(e) => JobOutcome::Failure(format!("handler panicked: {e}")),
                }
            }
            None => {
                warn!(job_id = %job.id, job_type = %job.job_type, "no handler for job");
                JobOutcome::Failure(format!("no handler registered for {}", job.job_type))
            }
        };

        let store = self.queue.store();
        let now = Utc::now();
        let (error, retry_at) = match outcome {
            JobOutcome::Success => {
                store.complete(job.id, now).await?;
                debug!(job_id = %job.id, "job completed");
                self.bump(|s| {
                    s.jobs_processed += 1;
                    s.jobs_succeeded += 1;
                });
                return Ok(());
            }
            JobOutcome::Failure(error) => {
                let retry_at = config.retry_policy.retry_at(job.attempts + 1, now);
                (error, retry_at)
            }
            JobOutcome::RetryAfter(delay) => (
                "retry requested".to_string(),
                now + chrono::Duration::from_std(delay).unwrap_or_default(),
            ),
        };

        let updated = store.fail(job.id, &error, retry_at, now).await?;
        if updated.status == JobStatus::Failed {
            warn!(
                job_id = %job.id,
                attempts = updated.attempts,
                error = %error,
                "job failed permanently"
            );
            self.bump(|s| {
                s.jobs_processed += 1;
                s.jobs_failed += 1;
            });
        } else {
            debug!(job_id = %job.id, retry_at = %retry_at, error = %error, "job scheduled for retry");
            self.bump(|s| {
                s.jobs_processed += 1;
                s.jobs_retried += 1;
            });
        }
        Ok(())
    }

    fn bump(&self, update: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Run the executor on the current tokio runtime until shut down.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(executor_loop(self, config, shutdown_rx));

        JobExecutorHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn executor_loop<S: JobStore + 'static>(
    executor: JobExecutor<S>,
    config: JobExecutorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    while !*shutdown.borrow() {
        let idle = match executor.run_once(&config).await {
            Ok(count) => count == 0,
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to dequeue jobs");
                true
            }
        };
        executor.bump(|s| s.uptime_secs = start_time.elapsed().as_secs());

        if idle {
            tokio::select! {
                changed = shutdown.changed() => {
                    // Handle dropped without an explicit shutdown.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
