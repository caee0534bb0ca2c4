//! Postgres-backed Job Record Store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | Constraint | JobStoreError |
//! |------------|------------|---------------|
//! | Database `23505` | `jobs_pkey` | `AlreadyExists` |
//! | Database `23505` | `jobs_exclusive_active_idx` | `Conflict` |
//! | anything else | | `Storage` |
//!
//! ## Concurrency
//!
//! The exclusivity invariant is enforced by a partial unique index over the
//! non-terminal statuses, never by check-then-insert. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never select the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use sitefleet_core::{ArticleId, DomainId};

use super::store::{JobStats, JobStore, JobStoreError, ReapOutcome, LEASE_EXPIRED};
use super::types::{dequeue_order, Job, JobId, JobStatus, JobType};

/// Primary key constraint name.
pub const PRIMARY_KEY_CONSTRAINT: &str = "jobs_pkey";

/// Partial unique index backing the exclusivity invariant.
pub const EXCLUSIVE_INDEX: &str = "jobs_exclusive_active_idx";

/// DDL for the `jobs` table. Idempotent.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID NOT NULL,
    job_type TEXT NOT NULL,
    domain_id UUID,
    article_id UUID,
    priority SMALLINT NOT NULL DEFAULT 1 CHECK (priority >= 1),
    payload JSONB NOT NULL DEFAULT '{}'::jsonb,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'cancelled')),
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts >= 1),
    scheduled_for TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    dispatched_at TIMESTAMPTZ,
    last_error TEXT,
    CONSTRAINT jobs_pkey PRIMARY KEY (id)
);

CREATE UNIQUE INDEX IF NOT EXISTS jobs_exclusive_active_idx
    ON jobs (job_type, domain_id)
    WHERE status IN ('pending', 'processing')
      AND job_type IN ('deploy', 'review_domain', 'sync_nameservers');

CREATE INDEX IF NOT EXISTS jobs_ready_idx
    ON jobs (priority DESC, scheduled_for, created_at)
    WHERE status = 'pending';

CREATE INDEX IF NOT EXISTS jobs_processing_idx
    ON jobs (started_at)
    WHERE status = 'processing';
"#;

const JOB_COLUMNS: &str = "id, job_type, domain_id, article_id, priority, payload, status, \
     attempts, max_attempts, scheduled_for, started_at, completed_at, created_at, \
     dispatched_at, last_error";

/// Postgres-backed job store.
///
/// `PgPool` is internally reference counted, so clones share one pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Insert a job inside the caller's transaction.
    ///
    /// The row only becomes visible (and dispatchable) once `tx` commits.
    #[instrument(skip(tx, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    pub async fn insert_tx(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
    ) -> Result<JobId, JobStoreError> {
        insert_query(job)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_insert_error(job, e))?;
        Ok(job.id)
    }

    async fn transition(
        &self,
        operation: &str,
        id: JobId,
        sql: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let updated = sqlx::query(sql)
            .bind(id.as_uuid())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        match self.get(id).await? {
            Some(job) => Err(JobStoreError::InvalidTransition {
                id,
                status: job.status,
            }),
            None => Err(JobStoreError::NotFound(id)),
        }
    }
}

fn insert_query(job: &Job) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, job_type, domain_id, article_id, priority, payload, status,
            attempts, max_attempts, scheduled_for, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.job_type.as_str())
    .bind(job.domain_id.map(Uuid::from))
    .bind(job.article_id.map(Uuid::from))
    .bind(job.priority)
    .bind(&job.payload)
    .bind(job.status.as_str())
    .bind(job.attempts)
    .bind(job.max_attempts)
    .bind(job.scheduled_for)
    .bind(job.created_at)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        insert_query(&job)
            .execute(&self.pool)
            .await
            .map_err(|e| map_insert_error(&job, e))?;
        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = $2
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'pending' AND scheduled_for <= $2
                ORDER BY priority DESC, scheduled_for ASC, created_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit as i64)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_ready", e))?;

        // RETURNING does not preserve the subquery order.
        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(dequeue_order);

        debug!(count = jobs.len(), "claimed jobs");
        Ok(jobs)
    }

    async fn start(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = $2
            WHERE id = $1 AND status = 'pending' AND scheduled_for <= $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("start", e))?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        self.transition(
            "complete",
            id,
            r#"
            UPDATE jobs SET status = 'completed', completed_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
            now,
        )
        .await
    }

    #[instrument(skip(self, error), err)]
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                last_error = $2,
                dispatched_at = NULL,
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempts + 1 >= max_attempts THEN $4 ELSE NULL END,
                started_at = CASE WHEN attempts + 1 >= max_attempts THEN started_at ELSE NULL END,
                scheduled_for = CASE WHEN attempts + 1 >= max_attempts THEN scheduled_for ELSE $3 END
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(error)
        .bind(retry_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.get(id).await? {
                Some(job) => Err(JobStoreError::InvalidTransition {
                    id,
                    status: job.status,
                }),
                None => Err(JobStoreError::NotFound(id)),
            },
        }
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        self.transition(
            "cancel",
            id,
            r#"
            UPDATE jobs SET status = 'cancelled', completed_at = $2
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
            now,
        )
        .await
    }

    async fn mark_dispatched(
        &self,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();

        let updated = sqlx::query(
            r#"
            UPDATE jobs SET dispatched_at = $2
            WHERE id = ANY($1) AND status = 'pending' AND scheduled_for <= $2
            "#,
        )
        .bind(&ids)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_dispatched", e))?;

        Ok(updated.rows_affected())
    }

    async fn clear_dispatched(&self, ids: &[JobId]) -> Result<u64, JobStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();

        let updated = sqlx::query(
            r#"
            UPDATE jobs SET dispatched_at = NULL
            WHERE id = ANY($1) AND status = 'pending' AND dispatched_at IS NOT NULL
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("clear_dispatched", e))?;

        Ok(updated.rows_affected())
    }

    async fn due_undispatched(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE status = 'pending' AND dispatched_at IS NULL AND scheduled_for <= $1
            ORDER BY priority DESC, scheduled_for ASC, created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_undispatched", e))?;

        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }

    #[instrument(skip(self), err)]
    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReapOutcome, JobStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                last_error = $3,
                dispatched_at = NULL,
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempts + 1 >= max_attempts THEN $2 ELSE NULL END,
                started_at = CASE WHEN attempts + 1 >= max_attempts THEN started_at ELSE NULL END,
                scheduled_for = CASE WHEN attempts + 1 >= max_attempts THEN scheduled_for ELSE $2 END
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'processing' AND started_at < $1
                ORDER BY started_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, status
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(LEASE_EXPIRED)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_stale", e))?;

        let mut outcome = ReapOutcome::default();
        for row in rows {
            let id: Uuid = row.try_get("id").map_err(|e| decode_error("id", e))?;
            let status: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
            if status == JobStatus::Failed.as_str() {
                outcome.failed.push(JobId::from_uuid(id));
            } else {
                outcome.requeued.push(JobId::from_uuid(id));
            }
        }
        Ok(outcome)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
            let total: i64 = row.try_get("total").map_err(|e| decode_error("total", e))?;
            let total = total as u64;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => stats.pending = total,
                Ok(JobStatus::Processing) => stats.processing = total,
                Ok(JobStatus::Completed) => stats.completed = total,
                Ok(JobStatus::Failed) => stats.failed = total,
                Ok(JobStatus::Cancelled) => stats.cancelled = total,
                Err(e) => return Err(JobStoreError::Storage(e.to_string())),
            }
        }
        Ok(stats)
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let job_type: String = row.try_get("job_type").map_err(|e| decode_error("job_type", e))?;
    let status: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
    let domain_id: Option<Uuid> = row.try_get("domain_id").map_err(|e| decode_error("domain_id", e))?;
    let article_id: Option<Uuid> =
        row.try_get("article_id").map_err(|e| decode_error("article_id", e))?;
    let id: Uuid = row.try_get("id").map_err(|e| decode_error("id", e))?;

    Ok(Job {
        id: JobId::from_uuid(id),
        job_type: job_type
            .parse::<JobType>()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?,
        domain_id: domain_id.map(DomainId::from_uuid),
        article_id: article_id.map(ArticleId::from_uuid),
        priority: row.try_get("priority").map_err(|e| decode_error("priority", e))?,
        payload: row.try_get("payload").map_err(|e| decode_error("payload", e))?,
        status: status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?,
        attempts: row.try_get("attempts").map_err(|e| decode_error("attempts", e))?,
        max_attempts: row
            .try_get("max_attempts")
            .map_err(|e| decode_error("max_attempts", e))?,
        scheduled_for: row
            .try_get("scheduled_for")
            .map_err(|e| decode_error("scheduled_for", e))?,
        started_at: row.try_get("started_at").map_err(|e| decode_error("started_at", e))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| decode_error("completed_at", e))?,
        created_at: row.try_get("created_at").map_err(|e| decode_error("created_at", e))?,
        dispatched_at: row
            .try_get("dispatched_at")
            .map_err(|e| decode_error("dispatched_at", e))?,
        last_error: row.try_get("last_error").map_err(|e| decode_error("last_error", e))?,
    })
}

fn decode_error(column: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode column {column}: {err}"))
}

/// Map an insert failure, resolving unique violations by constraint name.
fn map_insert_error(job: &Job, err: sqlx::Error) -> JobStoreError {
    match unique_violation_constraint(&err).as_deref() {
        Some(PRIMARY_KEY_CONSTRAINT) => JobStoreError::AlreadyExists(job.id),
        Some(EXCLUSIVE_INDEX) => match job.domain_id {
            Some(domain_id) => JobStoreError::Conflict {
                job_type: job.job_type,
                domain_id,
            },
            None => map_sqlx_error("insert", err),
        },
        _ => map_sqlx_error("insert", err),
    }
}

/// Constraint name of a `23505` unique violation, if that is what `err` is.
fn unique_violation_constraint(err: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return db_err.constraint().map(str::to_string);
        }
    }
    None
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
