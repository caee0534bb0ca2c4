//! Core job types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sitefleet_core::{ArticleId, DomainError, DomainId, DomainResult};

/// Default priority for new jobs.
pub const DEFAULT_PRIORITY: i16 = 1;

/// Default retry budget for new jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Unique job identifier.
///
/// Caller-assignable so producers can make creation idempotent across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))
    }
}

/// Which handler consumes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Keyword and SERP research ahead of outlining.
    Research,
    GenerateOutline,
    GenerateDraft,
    Humanize,
    SeoOptimize,
    GenerateMeta,
    /// Build and publish a domain's site.
    Deploy,
    /// Seed a fresh domain with an initial batch of articles.
    BulkSeed,
    ReviewDomain,
    IngestListing,
    SyncNameservers,
}

impl JobType {
    pub const ALL: [JobType; 11] = [
        JobType::Research,
        JobType::GenerateOutline,
        JobType::GenerateDraft,
        JobType::Humanize,
        JobType::SeoOptimize,
        JobType::GenerateMeta,
        JobType::Deploy,
        JobType::BulkSeed,
        JobType::ReviewDomain,
        JobType::IngestListing,
        JobType::SyncNameservers,
    ];

    /// Job types where at most one non-terminal job may exist per domain.
    ///
    /// Must match the predicate of `jobs_exclusive_active_idx`.
    pub const EXCLUSIVE: [JobType; 3] =
        [JobType::Deploy, JobType::ReviewDomain, JobType::SyncNameservers];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Research => "research",
            JobType::GenerateOutline => "generate_outline",
            JobType::GenerateDraft => "generate_draft",
            JobType::Humanize => "humanize",
            JobType::SeoOptimize => "seo_optimize",
            JobType::GenerateMeta => "generate_meta",
            JobType::Deploy => "deploy",
            JobType::BulkSeed => "bulk_seed",
            JobType::ReviewDomain => "review_domain",
            JobType::IngestListing => "ingest_listing",
            JobType::SyncNameservers => "sync_nameservers",
        }
    }

    pub fn is_exclusive(&self) -> bool {
        Self::EXCLUSIVE.contains(self)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be picked up
    Pending,
    /// Claimed by a worker
    Processing,
    Completed,
    /// Retries exhausted
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How long a failed job waits before it becomes eligible again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        if attempt <= 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let exp = (attempt - 1).min(30) as u32;
                self.base_delay.saturating_mul(2_u32.saturating_pow(exp))
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt as u32),
        };

        delay.min(self.max_delay)
    }

    /// Absolute time at which the retry becomes eligible.
    pub fn retry_at(&self, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.delay_for_attempt(attempt)).unwrap_or_default()
    }
}

/// Everything a producer supplies to Enqueue.
///
/// Store-assigned fields (`status`, `attempts`, timestamps) are absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Option<JobId>,
    pub job_type: JobType,
    pub domain_id: Option<DomainId>,
    pub article_id: Option<ArticleId>,
    pub priority: i16,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    /// `None` means "now".
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn new(job_type: JobType) -> Self {
        Self {
            id: None,
            job_type,
            domain_id: None,
            article_id: None,
            priority: DEFAULT_PRIORITY,
            payload: serde_json::Value::Object(Default::default()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_for: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn for_domain(mut self, domain_id: DomainId) -> Self {
        self.domain_id = Some(domain_id);
        self
    }

    pub fn for_article(mut self, article_id: ArticleId) -> Self {
        self.article_id = Some(article_id);
        self
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_for =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.priority < 1 {
            return Err(DomainError::validation(format!(
                "priority must be >= 1, got {}",
                self.priority
            )));
        }
        if self.max_attempts < 1 {
            return Err(DomainError::validation(format!(
                "max_attempts must be >= 1, got {}",
                self.max_attempts
            )));
        }
        if self.job_type.is_exclusive() && self.domain_id.is_none() {
            return Err(DomainError::validation(format!(
                "{} jobs require a domain_id",
                self.job_type
            )));
        }
        Ok(())
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub domain_id: Option<DomainId>,
    pub article_id: Option<ArticleId>,
    pub priority: i16,
    /// Opaque to the queue; interpreted by the handler only.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Last time the ID was pushed onto the dispatch list.
    pub dispatched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    /// Materialize a new pending row from a spec.
    pub fn from_spec(spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id.unwrap_or_default(),
            job_type: spec.job_type,
            domain_id: spec.domain_id,
            article_id: spec.article_id,
            priority: spec.priority,
            payload: spec.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: spec.max_attempts,
            scheduled_for: spec.scheduled_for.unwrap_or(now),
            started_at: None,
            completed_at: None,
            created_at: now,
            dispatched_at: None,
            last_error: None,
        }
    }

    /// Pending and due.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }

    /// Whether this row occupies the exclusivity slot for its `(job_type, domain_id)`.
    pub fn holds_exclusive_slot(&self) -> bool {
        self.job_type.is_exclusive() && self.domain_id.is_some() && !self.status.is_terminal()
    }

    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Record a failed attempt.
    ///
    /// Returns to `pending` at `retry_at` until the retry budget is spent.
    pub fn mark_failed(&mut self, error: String, retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_error = Some(error);
        self.dispatched_at = None;

        if self.attempts >= self.max_attempts {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
        } else {
            self.status = JobStatus::Pending;
            self.started_at = None;
            self.scheduled_for = retry_at;
        }
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
    }
}

/// Store-direct dequeue order: priority DESC, scheduled_for ASC, created_at ASC, id ASC.
pub fn dequeue_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.scheduled_for.cmp(&b.scheduled_for))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}
