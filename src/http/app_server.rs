use crate::http::controllers::{
    blacklist_token_handler, cache_stats_handler, health_handler, invalidate_role_handler,
    invalidate_user_handler, render_dashboard_handler,
};
use crate::RenderEngine;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

pub struct AppServer {
    pub router: Router,
    pub engine: Arc<RenderEngine>,
}

pub const PATH_HEALTH: &str = "/health";
pub const PATH_RENDER_DASHBOARD: &str = "/dashboards/{dashboard_id}/render";
pub const PATH_CACHE_STATS: &str = "/cache/stats";
pub const PATH_CACHE_USER: &str = "/cache/users/{user_id}";
pub const PATH_CACHE_ROLE: &str = "/cache/roles/{role_id}";
pub const PATH_TOKEN_BLACKLIST: &str = "/tokens/{token_id}/blacklist";

/// Caller identity, set by the authenticating proxy in front of this service.
pub const HEADER_USER_ID: &str = "x-user-id";
/// Session token id, checked against the blacklist when present.
pub const HEADER_TOKEN_ID: &str = "x-token-id";

impl AppServer {
    pub fn new(engine: RenderEngine) -> Self {
        Self::from_arc(Arc::new(engine))
    }

    pub fn from_arc(engine: Arc<RenderEngine>) -> Self {
        AppServer {
            router: Router::new()
                .route(PATH_HEALTH, get(health_handler))
                .route(PATH_RENDER_DASHBOARD, post(render_dashboard_handler))
                .route(PATH_CACHE_STATS, get(cache_stats_handler))
                .route(PATH_CACHE_USER, delete(invalidate_user_handler))
                .route(PATH_CACHE_ROLE, delete(invalidate_role_handler))
                .route(PATH_TOKEN_BLACKLIST, post(blacklist_token_handler))
                .with_state(engine.clone()),
            engine,
        }
    }
}
