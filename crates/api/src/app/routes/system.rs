use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::app::errors::queue_error_to_response;
use crate::app::services::AppServices;

/// Most events returned by `/health/jobs`.
const MAX_RECENT_EVENTS: usize = 100;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn queue_health(Extension(services): Extension<AppServices>) -> axum::response::Response {
    match services.queue.health().await {
        Ok(health) => Json(health).into_response(),
        Err(e) => queue_error_to_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct JobStatsQuery {
    /// Number of recent enqueue events to include.
    #[serde(default)]
    pub events: Option<usize>,
}

pub async fn job_stats(
    Extension(services): Extension<AppServices>,
    Query(query): Query<JobStatsQuery>,
) -> axum::response::Response {
    let stats = match services.queue.stats().await {
        Ok(stats) => stats,
        Err(e) => return queue_error_to_response(e),
    };

    let limit = query.events.unwrap_or(0).min(MAX_RECENT_EVENTS);
    let recent_events = if limit == 0 {
        Vec::new()
    } else {
        match services.queue.recent_events(limit).await {
            Ok(events) => events,
            Err(e) => return queue_error_to_response(e),
        }
    };

    Json(json!({
        "stats": stats,
        "recent_events": recent_events,
    }))
    .into_response()
}
