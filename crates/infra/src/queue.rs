//! Job queue: admission and dispatch over a Job Record Store.
//!
//! ## Backends
//!
//! Exactly one `Backend` is chosen at startup and never switched:
//!
//! - `StoreDirect`: workers claim rows from the store with a locking read
//! - `Accelerated`: eligible ids are pushed onto a dispatch list and popped by workers
//!
//! ## Flow
//!
//! ```text
//! producer -> enqueue -> store.insert -> (accelerated, eligible) push -> event log
//! producer -> enqueue_deferred / enqueue_in_tx -> commit -> requeue -> push
//! worker   -> dequeue -> store.start / store.get -> handler -> complete / fail
//! ```
//!
//! Accelerator pushes and event appends are best-effort: the durable insert
//! decides success, and the sweeper promotes rows that never reached the list.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument, warn};

use sitefleet_core::{DomainError, DomainId};

use crate::dispatch::{DispatchError, DispatchQueue, EventLog, InMemoryEventLog, JobEvent};
use crate::jobs::postgres::PostgresJobStore;
use crate::jobs::{Job, JobId, JobSpec, JobStats, JobStore, JobStoreError, JobType};

/// Dispatch mechanism, selected once per process.
#[derive(Clone)]
pub enum Backend {
    /// Workers poll the store directly.
    StoreDirect,
    /// Ready ids are handed off through a list-based accelerator.
    Accelerated(Arc<dyn DispatchQueue>),
}

impl Backend {
    /// Backend identifier reported by health checks.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StoreDirect => "postgres",
            Self::Accelerated(_) => "redis",
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::StoreDirect => "store-direct",
            Self::Accelerated(_) => "accelerated",
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, Self::Accelerated(_))
    }

    pub fn dispatch(&self) -> Option<&Arc<dyn DispatchQueue>> {
        match self {
            Self::StoreDirect => None,
            Self::Accelerated(queue) => Some(queue),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreDirect => f.write_str("StoreDirect"),
            Self::Accelerated(queue) => f
                .debug_struct("Accelerated")
                .field("pending_key", &queue.pending_key())
                .finish(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("invalid job: {0}")]
    Validation(String),

    /// An exclusive job for this domain is still pending or processing.
    #[error("{job_type} already in progress for domain {domain_id}")]
    Conflict { job_type: JobType, domain_id: DomainId },

    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    #[error(transparent)]
    Store(JobStoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl QueueError {
    /// True for both duplicate kinds; callers answer these with a 409.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists(_))
    }
}

impl From<JobStoreError> for QueueError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Conflict { job_type, domain_id } => Self::Conflict { job_type, domain_id },
            JobStoreError::AlreadyExists(id) => Self::AlreadyExists(id),
            other => Self::Store(other),
        }
    }
}

impl From<DomainError> for QueueError {
    fn from(err: DomainError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Operational snapshot of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub backend: &'static str,
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_depth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_key: Option<String>,
}

/// Enqueue/dequeue/requeue/health over a store and a backend.
pub struct JobQueue<S> {
    store: S,
    backend: Backend,
    events: Arc<dyn EventLog>,
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S, backend: Backend, events: Arc<dyn EventLog>) -> Self {
        Self {
            store,
            backend,
            events,
        }
    }

    /// Store-direct queue with an in-process event log.
    pub fn store_direct(store: S) -> Self {
        Self::new(store, Backend::StoreDirect, Arc::new(InMemoryEventLog::default()))
    }

    /// Accelerated queue; `dispatch` holds both the pending list and the event list.
    pub fn accelerated<D>(store: S, dispatch: Arc<D>) -> Self
    where
        D: DispatchQueue + EventLog + 'static,
    {
        let events: Arc<dyn EventLog> = dispatch.clone();
        Self::new(store, Backend::Accelerated(dispatch), events)
    }

    pub fn with_event_log(mut self, events: Arc<dyn EventLog>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Persist a job and, when accelerated and eligible, dispatch it.
    ///
    /// Fails with [`QueueError::Conflict`] or [`QueueError::AlreadyExists`]
    /// on duplicates. Accelerator failures are logged, never returned.
    #[instrument(skip(self, spec), fields(job_type = %spec.job_type), err)]
    pub async fn enqueue(&self, spec: JobSpec) -> Result<JobId, QueueError> {
        self.admit(spec, true).await
    }

    /// Persist a job without dispatching it. Call [`JobQueue::requeue`] later.
    #[instrument(skip(self, spec), fields(job_type = %spec.job_type), err)]
    pub async fn enqueue_deferred(&self, spec: JobSpec) -> Result<JobId, QueueError> {
        self.admit(spec, false).await
    }

    async fn admit(&self, spec: JobSpec, dispatch: bool) -> Result<JobId, QueueError> {
        spec.validate()?;

        let now = Utc::now();
        let job = Job::from_spec(spec, now);
        let job_type = job.job_type;
        let eligible = job.is_eligible(now);

        let id = self.store.insert(job).await?;

        if dispatch && eligible {
            self.push(&[id]).await;
        }
        self.record(JobEvent::new(id, job_type, now)).await;

        debug!(job_id = %id, eligible, "job enqueued");
        Ok(id)
    }

    /// Pop or claim up to `max` ready job ids.
    ///
    /// Store-direct ids are already `processing`; accelerated ids must be
    /// claimed with [`JobStore::start`].
    #[instrument(skip(self), err)]
    pub async fn dequeue(&self, max: usize) -> Result<Vec<JobId>, QueueError> {
        if max == 0 {
            return Ok(vec![]);
        }
        let ids = match &self.backend {
            Backend::Accelerated(queue) => queue.pop(max).await?,
            Backend::StoreDirect => self
                .store
                .claim_ready(max, Utc::now())
                .await?
                .into_iter()
                .map(|job| job.id)
                .collect(),
        };
        debug!(count = ids.len(), "dequeued jobs");
        Ok(ids)
    }

    /// Dispatch ids that are already committed and pending. No-op in
    /// store-direct mode.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn requeue(&self, ids: &[JobId]) {
        if ids.is_empty() {
            return;
        }
        self.push(ids).await;
    }

    /// Backend, mode and, when accelerated, list depth and key names.
    pub async fn health(&self) -> Result<QueueHealth, QueueError> {
        let mut health = QueueHealth {
            backend: self.backend.name(),
            mode: self.backend.mode(),
            pending_depth: None,
            pending_key: None,
            event_key: None,
        };
        if let Backend::Accelerated(queue) = &self.backend {
            health.pending_depth = Some(queue.len().await?);
            health.pending_key = Some(queue.pending_key().to_string());
            health.event_key = Some(self.events.event_key().to_string());
        }
        Ok(health)
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats().await?)
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<JobEvent>, QueueError> {
        Ok(self.events.recent(limit).await?)
    }

    async fn push(&self, ids: &[JobId]) {
        let Backend::Accelerated(queue) = &self.backend else {
            return;
        };
        // Stamped before the push: a worker that claims and fails the row
        // before the push returns clears the stamp again.
        if let Err(e) = self.store.mark_dispatched(ids, Utc::now()).await {
            warn!(error = %e, count = ids.len(), "failed to mark jobs dispatched");
        }
        if let Err(e) = queue.push(ids).await {
            warn!(error = %e, count = ids.len(), "dispatch push failed, rows left for the sweeper");
            if let Err(e) = self.store.clear_dispatched(ids).await {
                warn!(error = %e, count = ids.len(), "failed to clear dispatch stamps");
            }
        }
    }

    async fn record(&self, event: JobEvent) {
        if let Err(e) = self.events.append(&event).await {
            warn!(error = %e, job_id = %event.id, "failed to append job event");
        }
    }
}

impl JobQueue<PostgresJobStore> {
    /// Insert a job inside the producer's transaction without dispatching it.
    ///
    /// Call [`JobQueue::requeue`] with the returned id once `tx` has committed.
    #[instrument(skip(self, tx, spec), fields(job_type = %spec.job_type), err)]
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        spec: JobSpec,
    ) -> Result<JobId, QueueError> {
        spec.validate()?;

        let now = Utc::now();
        let job = Job::from_spec(spec, now);
        let id = PostgresJobStore::insert_tx(tx, &job).await?;
        self.record(JobEvent::new(id, job.job_type, now)).await;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::dispatch::InMemoryDispatchQueue;
    use crate::jobs::{InMemoryJobStore, JobStatus};

    fn accelerated() -> (JobQueue<InMemoryJobStore>, Arc<InMemoryDispatchQueue>) {
        let dispatch = Arc::new(InMemoryDispatchQueue::new());
        (JobQueue::accelerated(InMemoryJobStore::new(), dispatch.clone()), dispatch)
    }

    #[tokio::test]
    async fn eligible_job_is_pushed_and_logged() {
        let (queue, dispatch) = accelerated();

        let id = queue.enqueue(JobSpec::new(JobType::GenerateDraft)).await.unwrap();

        assert_eq!(dispatch.pending_snapshot(), vec![id]);
        let events = queue.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].job_type, JobType::GenerateDraft);

        let row = queue.store().get(id).await.unwrap().unwrap();
        assert!(row.dispatched_at.is_some());
    }

    #[tokio::test]
    async fn delayed_job_is_logged_but_not_pushed() {
        let (queue, dispatch) = accelerated();

        let id = queue
            .enqueue(JobSpec::new(JobType::Deploy).for_domain(DomainId::new()).delayed(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(dispatch.pending_snapshot().is_empty());
        let events = queue.recent_events(10).await.unwrap();
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![id]);

        let row = queue.store().get(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.dispatched_at.is_none());
    }

    #[tokio::test]
    async fn store_direct_enqueue_without_accelerator() {
        // Only the event log is wired to the counting store; pushes or pops would show up too.
        let observed = Arc::new(InMemoryDispatchQueue::new());
        let queue = JobQueue::new(InMemoryJobStore::new(), Backend::StoreDirect, observed.clone());

        let id = queue
            .enqueue(JobSpec::new(JobType::GenerateOutline).with_payload(json!({"topic": "tides"})))
            .await
            .unwrap();
        queue
            .enqueue(JobSpec::new(JobType::Research).delayed(Duration::from_secs(60)))
            .await
            .unwrap();
        queue.requeue(&[id]).await;
        assert_eq!(queue.dequeue(5).await.unwrap(), vec![id]);

        assert!(queue.backend().dispatch().is_none());
        assert_eq!(observed.command_count(), 2);
        assert!(observed.pending_snapshot().is_empty());

        let row = queue.store().get(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Processing);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.payload, json!({"topic": "tides"}));
        assert_eq!(queue.recent_events(10).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_exclusive_enqueues_admit_exactly_one() {
        let queue = Arc::new(JobQueue::store_direct(InMemoryJobStore::new()));
        let domain = DomainId::new();

        let spawn = |queue: Arc<JobQueue<InMemoryJobStore>>| {
            tokio::spawn(async move {
                queue.enqueue(JobSpec::new(JobType::Deploy).for_domain(domain)).await
            })
        };
        let (a, b) = tokio::join!(spawn(queue.clone()), spawn(queue.clone()));
        let results = [a.unwrap(), b.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(err.is_duplicate());
        assert!(matches!(
            err,
            QueueError::Conflict { job_type: JobType::Deploy, domain_id } if *domain_id == domain
        ));
    }

    #[tokio::test]
    async fn reused_id_is_already_exists() {
        let queue = JobQueue::store_direct(InMemoryJobStore::new());
        let id = JobId::new();

        queue.enqueue(JobSpec::new(JobType::Humanize).with_id(id)).await.unwrap();
        let err = queue.enqueue(JobSpec::new(JobType::Humanize).with_id(id)).await.unwrap_err();

        assert!(matches!(err, QueueError::AlreadyExists(existing) if existing == id));
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected_before_insert() {
        let queue = JobQueue::store_direct(InMemoryJobStore::new());

        let err = queue.enqueue(JobSpec::new(JobType::Deploy)).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(!err.is_duplicate());

        let err = queue
            .enqueue(JobSpec::new(JobType::Research).with_priority(0))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dequeues_never_share_an_id() {
        let (queue, dispatch) = accelerated();
        let queue = Arc::new(queue);
        let prefilled: Vec<JobId> = (0..100).map(|_| JobId::new()).collect();
        dispatch.push(&prefilled).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.dequeue(10).await.unwrap() }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "{id} dequeued twice");
            }
        }
        assert_eq!(seen.len(), 80);
        assert_eq!(queue.health().await.unwrap().pending_depth, Some(20));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_store_direct_dequeues_never_share_a_row() {
        let queue = Arc::new(JobQueue::store_direct(InMemoryJobStore::new()));
        for _ in 0..30 {
            queue.enqueue(JobSpec::new(JobType::SeoOptimize)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..6 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.dequeue(8).await.unwrap() }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 30);
        assert_eq!(queue.stats().await.unwrap().processing, 30);
    }

    #[tokio::test]
    async fn store_direct_dequeue_prefers_priority() {
        let queue = JobQueue::store_direct(InMemoryJobStore::new());
        let low = queue.enqueue(JobSpec::new(JobType::GenerateMeta)).await.unwrap();
        let high = queue
            .enqueue(JobSpec::new(JobType::GenerateMeta).with_priority(9))
            .await
            .unwrap();

        assert_eq!(queue.dequeue(1).await.unwrap(), vec![high]);
        assert_eq!(queue.dequeue(5).await.unwrap(), vec![low]);
        assert!(queue.dequeue(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_after_deferred_enqueue_makes_ids_poppable() {
        let (queue, dispatch) = accelerated();

        let article = queue.enqueue_deferred(JobSpec::new(JobType::Research)).await.unwrap();
        let meta = queue.enqueue_deferred(JobSpec::new(JobType::GenerateMeta)).await.unwrap();
        assert!(dispatch.pending_snapshot().is_empty());

        queue.requeue(&[article, meta]).await;

        assert_eq!(queue.dequeue(10).await.unwrap(), vec![article, meta]);
        assert!(queue.store().get(article).await.unwrap().unwrap().dispatched_at.is_some());
    }

    /// Claims and fails every id it is handed before `push` returns.
    struct EagerWorker {
        list: InMemoryDispatchQueue,
        store: Arc<InMemoryJobStore>,
    }

    #[async_trait::async_trait]
    impl DispatchQueue for EagerWorker {
        async fn push(&self, ids: &[JobId]) -> Result<(), DispatchError> {
            self.list.push(ids).await?;
            let now = Utc::now();
            for id in self.list.pop(ids.len()).await? {
                if self.store.start(id, now).await.unwrap().is_some() {
                    self.store.fail(id, "handler crashed", now, now).await.unwrap();
                }
            }
            Ok(())
        }

        async fn pop(&self, max: usize) -> Result<Vec<JobId>, DispatchError> {
            self.list.pop(max).await
        }

        async fn len(&self) -> Result<u64, DispatchError> {
            self.list.len().await
        }

        fn pending_key(&self) -> &str {
            self.list.pending_key()
        }
    }

    #[tokio::test]
    async fn failure_during_push_leaves_row_promotable() {
        let store = InMemoryJobStore::arc();
        let worker = Arc::new(EagerWorker {
            list: InMemoryDispatchQueue::new(),
            store: store.clone(),
        });
        let queue = JobQueue::new(
            store.clone(),
            Backend::Accelerated(worker.clone()),
            Arc::new(InMemoryEventLog::default()),
        );

        let id = queue.enqueue(JobSpec::new(JobType::Research)).await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!((row.status, row.attempts), (JobStatus::Pending, 1));
        assert!(row.dispatched_at.is_none());
        assert_eq!(worker.len().await.unwrap(), 0);
        assert_eq!(store.due_undispatched(Utc::now(), 10).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn health_reports_list_depth() {
        let (queue, dispatch) = accelerated();
        let ids: Vec<JobId> = (0..7).map(|_| JobId::new()).collect();
        dispatch.push(&ids).await.unwrap();

        let health = queue.health().await.unwrap();
        assert_eq!(health.backend, "redis");
        assert_eq!(health.mode, "accelerated");
        assert_eq!(health.pending_depth, Some(7));
        assert_eq!(health.pending_key.as_deref(), Some("sitefleet:jobs:pending"));
        assert_eq!(health.event_key.as_deref(), Some("sitefleet:jobs:events"));
    }

    #[tokio::test]
    async fn store_direct_health_omits_list_fields() {
        let queue = JobQueue::store_direct(InMemoryJobStore::new());
        let health = queue.health().await.unwrap();

        assert_eq!(health.backend, "postgres");
        assert_eq!(health.mode, "store-direct");
        assert_eq!(health.pending_depth, None);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json, json!({"backend": "postgres", "mode": "store-direct"}));
    }

    #[tokio::test]
    async fn accelerator_outage_does_not_block_enqueue() {
        let (queue, dispatch) = accelerated();
        dispatch.set_unavailable(true);

        let id = queue.enqueue(JobSpec::new(JobType::BulkSeed)).await.unwrap();
        let row = queue.store().get(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.dispatched_at.is_none());

        queue.requeue(&[id]).await;
        assert!(matches!(queue.dequeue(1).await, Err(QueueError::Dispatch(_))));
        assert!(queue.health().await.is_err());

        dispatch.set_unavailable(false);
        assert!(dispatch.pending_snapshot().is_empty());
    }
}
