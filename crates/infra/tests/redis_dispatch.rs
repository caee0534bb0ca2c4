//! Redis dispatch list tests.
//!
//! ```text
//! TEST_REDIS_URL=redis://localhost:6379 cargo test -p sitefleet-infra --features redis
//! ```
//!
//! Each test uses its own keys and is skipped when `TEST_REDIS_URL` is unset.

#![cfg(feature = "redis")]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use sitefleet_infra::dispatch::{DispatchQueue, EventLog, JobEvent, RedisDispatchQueue};
use sitefleet_infra::jobs::{InMemoryJobStore, JobId, JobSpec, JobType};
use sitefleet_infra::JobQueue;

async fn dispatch(events_max_len: usize) -> Option<RedisDispatchQueue> {
    let url = std::env::var("TEST_REDIS_URL").ok()?;
    let suffix = JobId::new();
    let queue = RedisDispatchQueue::connect(
        url,
        Some(format!("sitefleet:test:{suffix}:pending")),
        Some(format!("sitefleet:test:{suffix}:events")),
        events_max_len,
    )
    .await
    .expect("failed to connect to TEST_REDIS_URL");
    queue.ping().await.expect("redis did not answer PING");
    Some(queue)
}

macro_rules! dispatch_or_skip {
    ($max:expr) => {
        match dispatch($max).await {
            Some(dispatch) => dispatch,
            None => {
                eprintln!("TEST_REDIS_URL not set, skipping");
                return;
            }
        }
    };
}

#[tokio::test]
async fn push_pop_is_fifo() {
    let dispatch = dispatch_or_skip!(100);
    let ids: Vec<JobId> = (0..5).map(|_| JobId::new()).collect();

    dispatch.push(&ids).await.unwrap();
    assert_eq!(dispatch.len().await.unwrap(), 5);
    assert_eq!(dispatch.pop(3).await.unwrap(), ids[..3].to_vec());
    assert_eq!(dispatch.pop(10).await.unwrap(), ids[3..].to_vec());
    assert!(dispatch.pop(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn event_list_is_trimmed() {
    let dispatch = dispatch_or_skip!(3);
    let events: Vec<JobEvent> = (0..5)
        .map(|_| JobEvent::new(JobId::new(), JobType::Research, Utc::now()))
        .collect();

    for event in &events {
        dispatch.append(event).await.unwrap();
    }
    let recent = dispatch.recent(10).await.unwrap();
    assert_eq!(
        recent.iter().map(|e| e.id).collect::<Vec<_>>(),
        events[2..].iter().map(|e| e.id).collect::<Vec<_>>()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeues_never_share_an_id() {
    let dispatch = Arc::new(dispatch_or_skip!(100));
    let queue = Arc::new(JobQueue::accelerated(InMemoryJobStore::new(), dispatch.clone()));
    let ids: Vec<JobId> = (0..60).map(|_| JobId::new()).collect();
    dispatch.push(&ids).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move { queue.dequeue(4).await.unwrap() }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "{id} popped twice");
        }
    }
    assert_eq!(seen.len(), 40);
    assert_eq!(queue.health().await.unwrap().pending_depth, Some(20));
}

#[tokio::test]
async fn enqueue_pushes_eligible_and_logs_everything() {
    let dispatch = Arc::new(dispatch_or_skip!(100));
    let queue = JobQueue::accelerated(InMemoryJobStore::new(), dispatch.clone());

    let now_id = queue.enqueue(JobSpec::new(JobType::GenerateOutline)).await.unwrap();
    let later_id = queue
        .enqueue(JobSpec::new(JobType::GenerateOutline).delayed(std::time::Duration::from_secs(60)))
        .await
        .unwrap();

    assert_eq!(dispatch.pop(10).await.unwrap(), vec![now_id]);
    let logged: Vec<JobId> = queue
        .recent_events(10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(logged, vec![now_id, later_id]);
}
