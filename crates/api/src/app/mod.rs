//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: queue wiring from configuration
//! - `routes/`: HTTP routes + handlers
//! - `errors.rs`: consistent error responses

use axum::{routing::get, Extension, Router};

pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: AppServices) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(Extension(services))
}
