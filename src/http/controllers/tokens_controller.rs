use crate::http::error::ApiError;
use crate::http::models::{BlacklistTokenRequest, BlacklistTokenResponse};
use crate::RenderEngine;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{Duration, Utc};
use std::sync::Arc;

/// Handler for POST /tokens/{token_id}/blacklist
#[tracing::instrument(
    name = "handler_blacklist_token",
    skip(engine, request),
    fields(dashrender.token_id = %token_id)
)]
pub async fn blacklist_token_handler(
    State(engine): State<Arc<RenderEngine>>,
    Path(token_id): Path<String>,
    Json(request): Json<BlacklistTokenRequest>,
) -> Result<Json<BlacklistTokenResponse>, ApiError> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id cannot be empty"));
    }
    let expires_at = request
        .expires_at
        .unwrap_or_else(|| Utc::now() + Duration::days(1));

    engine
        .tokens()
        .blacklist(&token_id, &request.user_id, expires_at)
        .await?;

    Ok(Json(BlacklistTokenResponse {
        token_id,
        blacklisted: true,
        expires_at,
    }))
}
