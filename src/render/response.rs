use super::transform::ChartData;
use crate::query::QuerySignature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartResultMetadata {
    pub row_count: usize,
    pub query_time_ms: u64,
    pub cache_hit: bool,
    pub deduplicated: bool,
    pub signature: QuerySignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartErrorKind {
    /// The data query failed.
    Query,
    /// The rows could not be shaped for the chart type.
    Transform,
    /// The chart pipeline panicked.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartError {
    pub kind: ChartErrorKind,
    pub message: String,
}

/// Outcome of one chart. Every chart of a rendered dashboard gets exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChartRenderResult {
    Success {
        chart_type: String,
        data: ChartData,
        metadata: ChartResultMetadata,
    },
    Error {
        error: ChartError,
    },
}

impl ChartRenderResult {
    pub fn error(kind: ChartErrorKind, message: impl Into<String>) -> Self {
        ChartRenderResult::Error {
            error: ChartError {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ChartRenderResult::Success { .. })
    }

    pub fn metadata(&self) -> Option<&ChartResultMetadata> {
        match self {
            ChartRenderResult::Success { metadata, .. } => Some(metadata),
            ChartRenderResult::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderMetadata {
    pub total_time_ms: u64,
    pub chart_count: usize,
    pub charts_succeeded: usize,
    pub charts_failed: usize,
    pub unique_queries: usize,
    pub deduplicated_queries: usize,
    /// Share of chart query requests served by another chart's query.
    pub dedup_rate: f64,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardRenderResponse {
    pub dashboard_id: String,
    pub charts: BTreeMap<String, ChartRenderResult>,
    pub metadata: RenderMetadata,
}

pub(crate) fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chart_result_wire_format() {
        let ok = ChartRenderResult::Success {
            chart_type: "number".to_string(),
            data: ChartData::Metric {
                value: 3.0,
                row_count: 1,
            },
            metadata: ChartResultMetadata {
                row_count: 1,
                query_time_ms: 4,
                cache_hit: false,
                deduplicated: true,
                signature: serde_json::from_value(json!("ab")).unwrap(),
            },
        };
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["data"]["kind"], "metric");
        assert_eq!(value["metadata"]["signature"], "ab");

        let err = ChartRenderResult::error(ChartErrorKind::Query, "timeout");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"status": "error", "error": {"kind": "query", "message": "timeout"}})
        );
    }

    #[test]
    fn test_ratio() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(2, 3), 2.0 / 3.0);
    }
}
