//! Job queue infrastructure: Postgres record store, Redis dispatch list,
//! configuration, and the workers that drain them.

pub mod config;
pub mod dispatch;
pub mod jobs;
pub mod queue;

pub use config::{BackendKind, ConfigError, QueueConfig};
pub use queue::{Backend, JobQueue, QueueError, QueueHealth};
