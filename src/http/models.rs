use crate::caches::NamespaceStats;
use crate::dashboard::ChartFilters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Response body for GET /health
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub cache_backend: String,
    pub cache_available: bool,
}

/// Request body for POST /dashboards/{dashboard_id}/render
#[derive(Debug, Default, Deserialize)]
pub struct RenderDashboardRequest {
    /// Filters applied to every chart unless the chart sets the same key.
    #[serde(default)]
    pub universal_filters: ChartFilters,
}

/// Response body for GET /cache/stats
#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub backend: String,
    pub available: bool,
    pub namespaces: BTreeMap<&'static str, NamespaceStats>,
}

/// Request body for POST /tokens/{token_id}/blacklist
#[derive(Debug, Deserialize)]
pub struct BlacklistTokenRequest {
    pub user_id: String,
    /// When the token itself expires. Defaults to one day from now.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Response body for POST /tokens/{token_id}/blacklist
#[derive(Debug, Serialize)]
pub struct BlacklistTokenResponse {
    pub token_id: String,
    pub blacklisted: bool,
    pub expires_at: DateTime<Utc>,
}
