pub mod health;
pub mod metrics;
pub mod previews;
pub mod proxy;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Health and preview API routes. `/metrics` and the HTTP middleware stack
/// are attached by the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/files/{file_id}/preview",
            post(previews::request_conversion).get(previews::get_preview_status),
        )
        .route(
            "/api/v1/files/{file_id}/preview/retry",
            post(previews::retry_preview),
        )
        .route(
            "/api/v1/files/{file_id}/preview/token",
            post(previews::issue_preview_token),
        )
        .route("/api/v1/preview", get(proxy::serve_preview))
        .with_state(state)
}
