//! Dispatch Queue: a low-latency list of ready job ids sitting in front of the
//! Job Record Store.
//!
//! The list only ever holds identifiers. It is an accelerator, never a second
//! source of truth: losing its contents loses no jobs, because the sweeper
//! promotes any eligible row that was never dispatched.
//!
//! ## Components
//!
//! - `DispatchQueue`: FIFO push/pop of job ids
//! - `EventLog`: bounded append-only audit trail of enqueued jobs
//! - `InMemoryDispatchQueue` / `InMemoryEventLog`: in-process implementations
//! - `RedisDispatchQueue` (feature `redis`): list-backed implementation

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{JobId, JobType};

pub use in_memory::{InMemoryDispatchQueue, InMemoryEventLog};
#[cfg(feature = "redis")]
pub use self::redis::RedisDispatchQueue;

/// Default key of the pending list.
pub const DEFAULT_PENDING_KEY: &str = "sitefleet:jobs:pending";

/// Default key of the event list.
pub const DEFAULT_EVENTS_KEY: &str = "sitefleet:jobs:events";

/// Default bound of the event log.
pub const DEFAULT_EVENTS_MAX_LEN: usize = 1000;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch store unavailable: {0}")]
    Unavailable(String),

    #[error("dispatch command failed: {0}")]
    Command(String),

    #[error("malformed dispatch entry: {0}")]
    Malformed(String),
}

/// Compact audit record appended for every enqueued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub ts: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(id: JobId, job_type: JobType, ts: DateTime<Utc>) -> Self {
        Self { id, job_type, ts }
    }
}

/// List of job ids that are ready to run now.
///
/// Pops must be atomic: two concurrent callers never receive the same entry.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Append ids to the back of the list, preserving order.
    async fn push(&self, ids: &[JobId]) -> Result<(), DispatchError>;

    /// Remove and return up to `max` ids from the front of the list.
    async fn pop(&self, max: usize) -> Result<Vec<JobId>, DispatchError>;

    /// Current list length.
    async fn len(&self) -> Result<u64, DispatchError>;

    /// Name of the pending list, for health reporting.
    fn pending_key(&self) -> &str;
}

/// Bounded log of enqueue events. Oldest entries are trimmed first.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: &JobEvent) -> Result<(), DispatchError>;

    /// Up to `limit` most recent events, oldest first.
    async fn recent(&self, limit: usize) -> Result<Vec<JobEvent>, DispatchError>;

    /// Name of the event list, for health reporting.
    fn event_key(&self) -> &str;
}
