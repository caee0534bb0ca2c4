//! Job records, the stores that persist them, and the workers that run them.
//!
//! ## Components
//!
//! - `Job` / `JobSpec`: the persisted row and what producers supply
//! - `JobStore`: Job Record Store contract (in-memory or Postgres)
//! - `JobExecutor`: reference worker running async handlers per `JobType`
//! - `Sweeper`: lease reaper and delayed-job promoter

pub mod executor;
pub mod postgres;
pub mod store;
pub mod sweeper;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobOutcome};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, ReapOutcome};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig, SweeperHandle};
pub use types::{
    BackoffStrategy, Job, JobId, JobSpec, JobStatus, JobType, RetryPolicy, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_PRIORITY,
};
