use crate::http::models::CacheStatsResponse;
use crate::RenderEngine;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

/// Handler for GET /cache/stats
pub async fn cache_stats_handler(State(engine): State<Arc<RenderEngine>>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        backend: engine.cache_backend_name().to_string(),
        available: engine.cache_available().await,
        namespaces: engine.cache_stats().snapshot(),
    })
}

/// Handler for DELETE /cache/users/{user_id}
#[tracing::instrument(
    name = "handler_invalidate_user",
    skip(engine),
    fields(dashrender.user_id = %user_id)
)]
pub async fn invalidate_user_handler(
    State(engine): State<Arc<RenderEngine>>,
    Path(user_id): Path<String>,
) -> StatusCode {
    engine.rbac().invalidate_user(&user_id).await;
    StatusCode::NO_CONTENT
}

/// Handler for DELETE /cache/roles/{role_id}
#[tracing::instrument(
    name = "handler_invalidate_role",
    skip(engine),
    fields(dashrender.role_id = %role_id)
)]
pub async fn invalidate_role_handler(
    State(engine): State<Arc<RenderEngine>>,
    Path(role_id): Path<String>,
) -> StatusCode {
    engine.rbac().invalidate_role(&role_id).await;
    StatusCode::NO_CONTENT
}
