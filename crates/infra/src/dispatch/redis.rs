//! Redis list-backed dispatch queue.
//!
//! ## Layout
//!
//! - **Pending list** (`sitefleet:jobs:pending`): job ids, `RPUSH` to enqueue,
//!   `LPOP key count` to dequeue. `LPOP` is atomic, so concurrent workers never
//!   receive the same entry.
//! - **Event list** (`sitefleet:jobs:events`): JSON `JobEvent`s appended with
//!   `RPUSH` and bounded with `LTRIM key -max -1` in one `MULTI` block.
//!
//! `LPOP` with a count requires Redis 6.2 or later.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument};

use super::{DispatchError, DispatchQueue, EventLog, JobEvent, DEFAULT_EVENTS_KEY, DEFAULT_PENDING_KEY};
use crate::jobs::JobId;

/// Dispatch queue and event log over Redis lists.
///
/// `ConnectionManager` reconnects transparently and is cheap to clone.
#[derive(Clone)]
pub struct RedisDispatchQueue {
    conn: ConnectionManager,
    pending_key: String,
    events_key: String,
    events_max_len: usize,
}

impl std::fmt::Debug for RedisDispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDispatchQueue")
            .field("pending_key", &self.pending_key)
            .field("events_key", &self.events_key)
            .field("events_max_len", &self.events_max_len)
            .finish()
    }
}

impl RedisDispatchQueue {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `pending_key` - pending list key (default: "sitefleet:jobs:pending")
    /// * `events_key` - event list key (default: "sitefleet:jobs:events")
    /// * `events_max_len` - event list bound
    pub async fn connect(
        redis_url: impl AsRef<str>,
        pending_key: Option<String>,
        events_key: Option<String>,
        events_max_len: usize,
    ) -> Result<Self, DispatchError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            pending_key: pending_key.unwrap_or_else(|| DEFAULT_PENDING_KEY.to_string()),
            events_key: events_key.unwrap_or_else(|| DEFAULT_EVENTS_KEY.to_string()),
            events_max_len: events_max_len.max(1),
        })
    }

    /// Round-trip `PING`, used at startup.
    pub async fn ping(&self) -> Result<(), DispatchError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

#[async_trait]
impl DispatchQueue for RedisDispatchQueue {
    #[instrument(skip(self, ids), fields(key = %self.pending_key, count = ids.len()), err)]
    async fn push(&self, ids: &[JobId]) -> Result<(), DispatchError> {
        if ids.is_empty() {
            return Ok(());
        }
        let values: Vec<String> = ids.iter().map(JobId::to_string).collect();

        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.pending_key)
            .arg(values)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %self.pending_key), err)]
    async fn pop(&self, max: usize) -> Result<Vec<JobId>, DispatchError> {
        if max == 0 {
            return Ok(vec![]);
        }

        let mut conn = self.conn.clone();
        let values: Option<Vec<String>> = redis::cmd("LPOP")
            .arg(&self.pending_key)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let ids = values
            .unwrap_or_default()
            .iter()
            .map(|raw| {
                raw.parse::<JobId>()
                    .map_err(|e| DispatchError::Malformed(format!("{raw}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count = ids.len(), "popped job ids");
        Ok(ids)
    }

    async fn len(&self) -> Result<u64, DispatchError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("LLEN")
            .arg(&self.pending_key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(len)
    }

    fn pending_key(&self) -> &str {
        &self.pending_key
    }
}

#[async_trait]
impl EventLog for RedisDispatchQueue {
    async fn append(&self, event: &JobEvent) -> Result<(), DispatchError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| DispatchError::Malformed(e.to_string()))?;
        let keep = -(self.events_max_len as i64);

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(&self.events_key)
            .arg(payload)
            .ignore()
            .cmd("LTRIM")
            .arg(&self.events_key)
            .arg(keep)
            .arg(-1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<JobEvent>, DispatchError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.events_key)
            .arg(-(limit as i64))
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        raw.iter()
            .map(|entry| {
                serde_json::from_str(entry).map_err(|e| DispatchError::Malformed(e.to_string()))
            })
            .collect()
    }

    fn event_key(&self) -> &str {
        &self.events_key
    }
}

fn map_redis_error(err: redis::RedisError) -> DispatchError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        DispatchError::Unavailable(err.to_string())
    } else {
        DispatchError::Command(err.to_string())
    }
}
