use crate::http::models::HealthResponse;
use crate::RenderEngine;
use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

/// Handler for GET /health
///
/// Always 200: an unavailable cache degrades latency, not correctness.
pub async fn health_handler(
    State(engine): State<Arc<RenderEngine>>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            service: "dashrender".to_string(),
            cache_backend: engine.cache_backend_name().to_string(),
            cache_available: engine.cache_available().await,
        }),
    )
}
