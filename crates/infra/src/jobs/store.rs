//! Job Record Store: the durable system of record for every job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use sitefleet_core::DomainId;

use super::types::{dequeue_order, Job, JobId, JobStatus, JobType};

/// Job store abstraction.
///
/// Every method is independently safe to call from concurrent tasks.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending row.
    ///
    /// Fails with [`JobStoreError::Conflict`] when an exclusive job for the same
    /// domain is still pending or processing, and with
    /// [`JobStoreError::AlreadyExists`] when the ID is taken.
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Select up to `limit` eligible rows in dequeue order and mark them
    /// `processing` in the same step. Concurrent callers never share a row.
    async fn claim_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Move a pending, due row to `processing`.
    ///
    /// Returns `None` if the row is missing, no longer pending or scheduled
    /// after `now`, so stale or duplicate dispatch entries can be skipped.
    async fn start(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Record a failed attempt; see [`Job::mark_failed`].
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Stamp `dispatched_at` on rows that are pending and due at `now`.
    ///
    /// Called before the push, so a worker that claims and fails the row
    /// before the push returns leaves it unstamped.
    async fn mark_dispatched(
        &self,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    /// Clear `dispatched_at` on pending rows whose push did not happen.
    async fn clear_dispatched(&self, ids: &[JobId]) -> Result<u64, JobStoreError>;

    /// Eligible pending rows that never reached the dispatch list.
    async fn due_undispatched(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, JobStoreError>;

    /// Return `processing` rows started before `cutoff` to `pending`, or fail
    /// them when their retry budget is spent.
    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReapOutcome, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("{job_type} already pending or processing for domain {domain_id}")]
    Conflict {
        job_type: JobType,
        domain_id: DomainId,
    },
    #[error("job {id} is {status}")]
    InvalidTransition { id: JobId, status: JobStatus },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Result of a lease sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Back to `pending`.
    pub requeued: Vec<JobId>,
    /// Retry budget exhausted.
    pub failed: Vec<JobId>,
}

impl ReapOutcome {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Error message recorded on rows whose lease expired.
pub const LEASE_EXPIRED: &str = "lease expired";

/// In-memory job store for tests/dev.
///
/// Mirrors the Postgres constraints, including the exclusivity index.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn jobs(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }

        if let (true, Some(domain_id)) = (job.holds_exclusive_slot(), job.domain_id) {
            let taken = jobs.values().any(|existing| {
                existing.holds_exclusive_slot()
                    && existing.job_type == job.job_type
                    && existing.domain_id == Some(domain_id)
            });
            if taken {
                return Err(JobStoreError::Conflict {
                    job_type: job.job_type,
                    domain_id,
                });
            }
        }

        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs()?.get(&id).cloned())
    }

    async fn claim_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs()?;

        let mut candidates: Vec<&Job> = jobs.values().filter(|j| j.is_eligible(now)).collect();
        candidates.sort_by(|a, b| dequeue_order(a, b));
        let ids: Vec<JobId> = candidates.into_iter().take(limit).map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_started(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn start(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs()?;
        match jobs.get_mut(&id) {
            Some(job) if job.is_eligible(now) => {
                job.mark_started(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::Processing {
            return Err(JobStoreError::InvalidTransition {
                id,
                status: job.status,
            });
        }
        job.mark_completed(now);
        Ok(())
    }

    async fn fail(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::Processing {
            return Err(JobStoreError::InvalidTransition {
                id,
                status: job.status,
            });
        }
        job.mark_failed(error.to_string(), retry_at, now);
        Ok(job.clone())
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition {
                id,
                status: job.status,
            });
        }
        job.mark_cancelled(now);
        Ok(())
    }

    async fn mark_dispatched(
        &self,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut jobs = self.jobs()?;
        let mut marked = 0;
        for id in ids {
            if let Some(job) = jobs.get_mut(id) {
                if job.is_eligible(now) {
                    job.dispatched_at = Some(now);
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    async fn clear_dispatched(&self, ids: &[JobId]) -> Result<u64, JobStoreError> {
        let mut jobs = self.jobs()?;
        let mut cleared = 0;
        for id in ids {
            if let Some(job) = jobs.get_mut(id) {
                if job.status == JobStatus::Pending && job.dispatched_at.take().is_some() {
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }

    async fn due_undispatched(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let jobs = self.jobs()?;
        let mut due: Vec<&Job> = jobs
            .values()
            .filter(|j| j.is_eligible(now) && j.dispatched_at.is_none())
            .collect();
        due.sort_by(|a, b| dequeue_order(a, b));
        Ok(due.into_iter().take(limit).map(|j| j.id).collect())
    }

    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReapOutcome, JobStoreError> {
        let mut jobs = self.jobs()?;
        let mut outcome = ReapOutcome::default();

        let stale = jobs
            .values_mut()
            .filter(|j| {
                j.status == JobStatus::Processing && j.started_at.is_some_and(|s| s < cutoff)
            })
            .take(limit);

        for job in stale {
            job.mark_failed(LEASE_EXPIRED.to_string(), now, now);
            if job.status == JobStatus::Failed {
                outcome.failed.push(job.id);
            } else {
                outcome.requeued.push(job.id);
            }
        }
        Ok(outcome)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(job.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn claim_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_ready(limit, now).await
    }

    async fn start(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).start(id, now).await
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).complete(id, now).await
    }

    async fn fail(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).fail(id, error, retry_at, now).await
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).cancel(id, now).await
    }

    async fn mark_dispatched(
        &self,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        (**self).mark_dispatched(ids, now).await
    }

    async fn clear_dispatched(&self, ids: &[JobId]) -> Result<u64, JobStoreError> {
        (**self).clear_dispatched(ids).await
    }

    async fn due_undispatched(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, JobStoreError> {
        (**self).due_undispatched(now, limit).await
    }

    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReapOutcome, JobStoreError> {
        (**self).reap_stale(cutoff, now, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
