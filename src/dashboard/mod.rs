//! Dashboard and chart definitions, as read from the definition store.

mod filters;

pub use filters::{merge_filters, resolve_chart};

use crate::access::AccessScope;
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Comparison applied by an advanced filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    IsNull,
    IsNotNull,
}

/// A predicate on an arbitrary column of the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedFilter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Filter predicates that can be stored on a chart or a dashboard, or passed at render time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub practice_uids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced_filters: Option<Vec<AdvancedFilter>>,
}

/// Presentation-only chart parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presentation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_palette: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacking_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDefinition {
    pub chart_id: String,
    pub chart_name: String,
    pub chart_type: String,
    pub data_source_id: i64,
    #[serde(default)]
    pub filters: ChartFilters,
    #[serde(default)]
    pub presentation: Presentation,
    /// Chart-type specific settings handed to the transformer untouched.
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardDefinition {
    pub dashboard_id: String,
    pub dashboard_name: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub default_filters: ChartFilters,
    /// Charts in display order.
    pub charts: Vec<ChartDefinition>,
}

/// One chart's render request after filter resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSpecification {
    pub chart_id: String,
    pub chart_name: String,
    pub chart_type: String,
    pub data_source_id: i64,
    /// Merged filters, practice uids already restricted to the caller's scope.
    pub filters: ChartFilters,
    pub scope: AccessScope,
    pub presentation: Presentation,
    pub config: serde_json::Value,
}

/// Read-only lookup of dashboard definitions.
#[async_trait]
pub trait DashboardStore: Debug + Send + Sync {
    /// Fetch a dashboard and its charts in display order.
    async fn get_dashboard(&self, dashboard_id: &str) -> Result<Option<DashboardDefinition>>;
}
