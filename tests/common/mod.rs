//! Shared fixtures for integration tests.

#![allow(dead_code)]

use dashrender::access::AccessContext;
use dashrender::cache::{CacheBackend, MemoryCacheBackend, NoopCacheBackend};
use dashrender::caches::UserContext;
use dashrender::config::{CacheConfig, RenderConfig};
use dashrender::dashboard::{ChartDefinition, ChartFilters, DashboardDefinition, Presentation};
use dashrender::query::Row;
use dashrender::store::{
    InMemoryDashboardStore, InMemoryQueryExecutor, InMemoryRbacStore, InMemoryTokenBlacklistStore,
};
use dashrender::RenderEngine;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const FINANCE_DASHBOARD: &str = "finance";
pub const CHARGES_SOURCE: i64 = 1;
pub const BROKEN_SOURCE: i64 = 2;

/// An engine over in-memory stores, with handles to every collaborator.
pub struct Fixture {
    pub engine: Arc<RenderEngine>,
    pub dashboards: Arc<InMemoryDashboardStore>,
    pub rbac: Arc<InMemoryRbacStore>,
    pub tokens: Arc<InMemoryTokenBlacklistStore>,
    pub executor: Arc<InMemoryQueryExecutor>,
}

pub enum CacheKind {
    Memory(Arc<MemoryCacheBackend>),
    Disabled,
}

impl CacheKind {
    pub fn memory() -> (Self, Arc<MemoryCacheBackend>) {
        let backend = Arc::new(MemoryCacheBackend::new());
        (CacheKind::Memory(backend.clone()), backend)
    }

    fn backend(&self) -> Arc<dyn CacheBackend> {
        match self {
            CacheKind::Memory(backend) => backend.clone(),
            CacheKind::Disabled => Arc::new(NoopCacheBackend),
        }
    }
}

pub async fn fixture(cache: CacheKind) -> Fixture {
    let dashboards = Arc::new(InMemoryDashboardStore::new());
    let rbac = Arc::new(InMemoryRbacStore::new());
    let tokens = Arc::new(InMemoryTokenBlacklistStore::new());
    let executor = Arc::new(InMemoryQueryExecutor::new());

    executor.insert_rows(CHARGES_SOURCE, charge_rows());
    executor.insert_rows(BROKEN_SOURCE, Vec::new());
    executor.fail_data_source(BROKEN_SOURCE);
    executor.set_latency(Duration::from_millis(20));

    rbac.insert_user(user("admin", true, vec![]));
    rbac.insert_user(user("north", false, vec![101]));
    rbac.insert_user(user("south", false, vec![202]));

    let engine = RenderEngine::builder()
        .cache_backend(cache.backend())
        .cache_config(CacheConfig::default())
        .render_config(RenderConfig::default())
        .dashboard_store(dashboards.clone())
        .rbac_store(rbac.clone())
        .token_store(tokens.clone())
        .executor(executor.clone())
        .build()
        .await
        .expect("engine should build");

    Fixture {
        engine: Arc::new(engine),
        dashboards,
        rbac,
        tokens,
        executor,
    }
}

pub fn user(user_id: &str, is_super_admin: bool, practices: Vec<i64>) -> UserContext {
    UserContext {
        user_id: user_id.to_string(),
        email: format!("{user_id}@example.com"),
        roles: vec![],
        permissions: vec!["analytics:read".to_string()],
        organization_ids: vec!["org-1".to_string()],
        accessible_practices: practices,
        is_super_admin,
    }
}

pub fn access(user: &UserContext) -> AccessContext {
    user.access_context()
}

pub fn charge_rows() -> Vec<Row> {
    serde_json::from_value(json!([
        {"practice_uid": 101, "date_index": "2024-01-31", "measure": "Charges", "frequency": "Monthly", "provider_name": "Dr. A", "measure_value": 100},
        {"practice_uid": 101, "date_index": "2024-02-29", "measure": "Charges", "frequency": "Monthly", "provider_name": "Dr. B", "measure_value": 150},
        {"practice_uid": 202, "date_index": "2024-01-31", "measure": "Charges", "frequency": "Monthly", "provider_name": "Dr. C", "measure_value": 80},
        {"practice_uid": 202, "date_index": "2024-02-29", "measure": "Payments", "frequency": "Monthly", "provider_name": "Dr. C", "measure_value": 60},
        {"practice_uid": 101, "date_index": "2024-02-29", "measure": "Payments", "frequency": "Monthly", "provider_name": "Dr. A", "measure_value": 90},
    ]))
    .expect("fixture rows")
}

pub fn chart(chart_id: &str, chart_type: &str, data_source_id: i64) -> ChartDefinition {
    ChartDefinition {
        chart_id: chart_id.to_string(),
        chart_name: chart_id.to_string(),
        chart_type: chart_type.to_string(),
        data_source_id,
        filters: ChartFilters::default(),
        presentation: Presentation::default(),
        config: json!({}),
    }
}

pub fn dashboard(dashboard_id: &str, charts: Vec<ChartDefinition>) -> DashboardDefinition {
    DashboardDefinition {
        dashboard_id: dashboard_id.to_string(),
        dashboard_name: "Finance".to_string(),
        organization_id: Some("org-1".to_string()),
        default_filters: ChartFilters {
            measure: Some("Charges".to_string()),
            frequency: Some("Monthly".to_string()),
            ..Default::default()
        },
        charts,
    }
}

/// Three charts over the same data query, differing only in presentation.
pub fn same_query_charts() -> Vec<ChartDefinition> {
    let line = chart("trend", "line", CHARGES_SOURCE);

    let mut bar = chart("by-provider", "bar", CHARGES_SOURCE);
    bar.presentation = Presentation {
        group_by: Some("provider_name".to_string()),
        color_palette: Some("ocean".to_string()),
        stacking_mode: Some("stacked".to_string()),
    };

    let total = chart("total", "number", CHARGES_SOURCE);
    vec![line, bar, total]
}
