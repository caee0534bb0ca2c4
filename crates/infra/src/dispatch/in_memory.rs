//! In-process dispatch list and event log.
//!
//! `InMemoryDispatchQueue` mirrors the Redis list semantics (FIFO, atomic
//! pops, LTRIM-bounded event list) for tests and single-process deployments.
//! `InMemoryEventLog` is the event log used in store-direct mode, where no
//! dispatch store exists.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    DispatchError, DispatchQueue, EventLog, JobEvent, DEFAULT_EVENTS_KEY, DEFAULT_EVENTS_MAX_LEN,
    DEFAULT_PENDING_KEY,
};
use crate::jobs::JobId;

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, DispatchError> {
    mutex
        .lock()
        .map_err(|_| DispatchError::Unavailable(format!("{what} lock poisoned")))
}

/// Bounded ring of job events.
#[derive(Debug)]
pub struct InMemoryEventLog {
    events: Mutex<VecDeque<JobEvent>>,
    max_len: usize,
    key: String,
}

impl InMemoryEventLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_len: max_len.max(1),
            key: DEFAULT_EVENTS_KEY.to_string(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS_MAX_LEN)
    }
}

fn append_bounded(events: &mut VecDeque<JobEvent>, event: &JobEvent, max_len: usize) {
    events.push_back(event.clone());
    while events.len() > max_len {
        events.pop_front();
    }
}

fn tail(events: &VecDeque<JobEvent>, limit: usize) -> Vec<JobEvent> {
    let skip = events.len().saturating_sub(limit);
    events.iter().skip(skip).cloned().collect()
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: &JobEvent) -> Result<(), DispatchError> {
        let mut events = lock(&self.events, "event log")?;
        append_bounded(&mut events, event, self.max_len);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<JobEvent>, DispatchError> {
        let events = lock(&self.events, "event log")?;
        Ok(tail(&events, limit))
    }

    fn event_key(&self) -> &str {
        &self.key
    }
}

/// In-process pending list plus event list.
///
/// `set_unavailable(true)` makes every call fail with
/// [`DispatchError::Unavailable`], simulating an accelerator outage.
/// `command_count()` counts calls that reached the store.
#[derive(Debug)]
pub struct InMemoryDispatchQueue {
    pending: Mutex<VecDeque<JobId>>,
    events: Mutex<VecDeque<JobEvent>>,
    events_max_len: usize,
    pending_key: String,
    events_key: String,
    unavailable: AtomicBool,
    commands: AtomicU64,
}

impl InMemoryDispatchQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
            events_max_len: DEFAULT_EVENTS_MAX_LEN,
            pending_key: DEFAULT_PENDING_KEY.to_string(),
            events_key: DEFAULT_EVENTS_KEY.to_string(),
            unavailable: AtomicBool::new(false),
            commands: AtomicU64::new(0),
        }
    }

    pub fn with_keys(mut self, pending_key: impl Into<String>, events_key: impl Into<String>) -> Self {
        self.pending_key = pending_key.into();
        self.events_key = events_key.into();
        self
    }

    pub fn with_events_max_len(mut self, max_len: usize) -> Self {
        self.events_max_len = max_len.max(1);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    /// Snapshot of the pending list, front first. Not counted as a command.
    pub fn pending_snapshot(&self) -> Vec<JobId> {
        self.pending
            .lock()
            .map(|pending| pending.iter().copied().collect())
            .unwrap_or_default()
    }

    fn command(&self) -> Result<(), DispatchError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DispatchError::Unavailable("connection refused".to_string()));
        }
        self.commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for InMemoryDispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn push(&self, ids: &[JobId]) -> Result<(), DispatchError> {
        self.command()?;
        lock(&self.pending, "pending list")?.extend(ids.iter().copied());
        Ok(())
    }

    async fn pop(&self, max: usize) -> Result<Vec<JobId>, DispatchError> {
        self.command()?;
        let mut pending = lock(&self.pending, "pending list")?;
        let take = max.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn len(&self) -> Result<u64, DispatchError> {
        self.command()?;
        Ok(lock(&self.pending, "pending list")?.len() as u64)
    }

    fn pending_key(&self) -> &str {
        &self.pending_key
    }
}

#[async_trait]
impl EventLog for InMemoryDispatchQueue {
    async fn append(&self, event: &JobEvent) -> Result<(), DispatchError> {
        self.command()?;
        let mut events = lock(&self.events, "event list")?;
        append_bounded(&mut events, event, self.events_max_len);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<JobEvent>, DispatchError> {
        self.command()?;
        let events = lock(&self.events, "event list")?;
        Ok(tail(&events, limit))
    }

    fn event_key(&self) -> &str {
        &self.events_key
    }
}
