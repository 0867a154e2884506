use crate::http::app_server::{HEADER_TOKEN_ID, HEADER_USER_ID};
use crate::http::error::ApiError;
use crate::http::models::RenderDashboardRequest;
use crate::render::DashboardRenderResponse;
use crate::RenderEngine;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Handler for POST /dashboards/{dashboard_id}/render
#[tracing::instrument(
    name = "handler_render_dashboard",
    skip(engine, headers, request),
    fields(
        dashrender.dashboard_id = %dashboard_id,
        dashrender.chart_count = tracing::field::Empty,
    )
)]
pub async fn render_dashboard_handler(
    State(engine): State<Arc<RenderEngine>>,
    Path(dashboard_id): Path<String>,
    headers: HeaderMap,
    request: Option<Json<RenderDashboardRequest>>,
) -> Result<Json<DashboardRenderResponse>, ApiError> {
    let user_id = header_str(&headers, HEADER_USER_ID)
        .ok_or_else(|| ApiError::unauthorized(format!("missing {} header", HEADER_USER_ID)))?;
    let token_id = header_str(&headers, HEADER_TOKEN_ID);

    let access = engine.authenticate(user_id, token_id).await?;
    let universal_filters = request
        .map(|Json(request)| request.universal_filters)
        .unwrap_or_default();

    let response = engine
        .render(&dashboard_id, universal_filters, access)
        .await?;

    tracing::Span::current().record("dashrender.chart_count", response.charts.len());
    Ok(Json(response))
}
