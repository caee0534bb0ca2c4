//! Queue wiring: picks the backend once from configuration.

use std::sync::Arc;

use tracing::info;

use sitefleet_infra::dispatch::{DispatchError, InMemoryEventLog};
use sitefleet_infra::jobs::JobStore;
use sitefleet_infra::{BackendKind, JobQueue, QueueConfig};

/// Queue over a type-erased store, shared by handlers and background tasks.
pub type SharedJobQueue = Arc<JobQueue<Arc<dyn JobStore>>>;

#[derive(Clone)]
pub struct AppServices {
    pub queue: SharedJobQueue,
}

impl AppServices {
    pub fn new(queue: SharedJobQueue) -> Self {
        Self { queue }
    }
}

/// Build the queue for the configured backend.
pub async fn build_queue(
    config: &QueueConfig,
    store: Arc<dyn JobStore>,
) -> Result<SharedJobQueue, DispatchError> {
    let queue = match config.backend {
        BackendKind::Postgres => {
            let events = InMemoryEventLog::new(config.events_max_len).with_key(config.events_key.clone());
            JobQueue::store_direct(store).with_event_log(Arc::new(events))
        }
        BackendKind::Redis => accelerated(config, store).await?,
    };

    info!(
        backend = queue.backend().name(),
        mode = queue.backend().mode(),
        "job queue ready"
    );
    Ok(Arc::new(queue))
}

#[cfg(feature = "redis")]
async fn accelerated(
    config: &QueueConfig,
    store: Arc<dyn JobStore>,
) -> Result<JobQueue<Arc<dyn JobStore>>, DispatchError> {
    use sitefleet_infra::dispatch::RedisDispatchQueue;

    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| DispatchError::Unavailable("REDIS_URL is not set".to_string()))?;
    let dispatch = RedisDispatchQueue::connect(
        url,
        Some(config.pending_key.clone()),
        Some(config.events_key.clone()),
        config.events_max_len,
    )
    .await?;
    dispatch.ping().await?;

    Ok(JobQueue::accelerated(store, Arc::new(dispatch)))
}

#[cfg(not(feature = "redis"))]
async fn accelerated(
    _config: &QueueConfig,
    _store: Arc<dyn JobStore>,
) -> Result<JobQueue<Arc<dyn JobStore>>, DispatchError> {
    Err(DispatchError::Unavailable(
        "built without the redis feature".to_string(),
    ))
}
