use axum::{routing::get, Router};

pub mod system;

/// Read-only queue visibility routes.
pub fn router() -> Router {
    Router::new()
        .route("/health/queue", get(system::queue_health))
        .route("/health/jobs", get(system::job_stats))
}
