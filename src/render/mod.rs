//! Dashboard render orchestration.
//!
//! A render resolves every chart's filters, hashes each chart's data query, runs
//! the unique queries once through the shared result cache, and collects one
//! result per chart. A failing chart never fails the dashboard.

mod dedup;
mod response;
mod transform;

pub use dedup::{QueryDeduplicator, QueryOutput, Resolved};
pub use response::{
    ChartError, ChartErrorKind, ChartRenderResult, ChartResultMetadata, DashboardRenderResponse,
    RenderMetadata,
};
pub use transform::{
    CategoryTransformer, ChartData, ChartTransformer, Dataset, MetricTransformer,
    SeriesTransformer, TableTransformer, TransformError, TransformerRegistry,
};

use crate::access::AccessContext;
use crate::caches::{CacheOutcome, DataSourceCache};
use crate::config::RenderConfig;
use crate::dashboard::{resolve_chart, ChartFilters, ChartSpecification, DashboardStore};
use crate::query::{QueryExecutor, QuerySignatureHasher};
use futures::{FutureExt, StreamExt};
use response::ratio;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that abort a render before any chart is dispatched.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("dashboard '{0}' not found")]
    DashboardNotFound(String),

    #[error("user '{user_id}' may not view dashboard '{dashboard_id}'")]
    AccessDenied {
        dashboard_id: String,
        user_id: String,
    },

    #[error("dashboard store error: {0}")]
    Store(String),
}

/// Lifecycle of one render, recorded on its span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    Init,
    FiltersResolved,
    Dispatched,
    Collected,
    Done,
}

impl RenderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderPhase::Init => "init",
            RenderPhase::FiltersResolved => "filters_resolved",
            RenderPhase::Dispatched => "dispatched",
            RenderPhase::Collected => "collected",
            RenderPhase::Done => "done",
        }
    }
}

fn enter_phase(phase: RenderPhase) {
    tracing::Span::current().record("dashrender.phase", phase.as_str());
    debug!(phase = phase.as_str(), "render phase");
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub dashboard_id: String,
    pub universal_filters: ChartFilters,
    pub access: AccessContext,
}

/// Query-side facts about one chart, used for the render metadata.
struct QueryStats {
    cache: CacheOutcome,
    deduplicated: bool,
}

struct ChartOutcome {
    chart_id: String,
    result: ChartRenderResult,
    query: Option<QueryStats>,
}

impl ChartOutcome {
    fn failed(chart_id: &str, kind: ChartErrorKind, message: impl Into<String>) -> Self {
        Self {
            chart_id: chart_id.to_string(),
            result: ChartRenderResult::error(kind, message),
            query: None,
        }
    }
}

/// Key of a chart's result. A chart id listed twice keeps both results; later
/// occurrences are keyed `{chart_id}#{position}`.
fn result_key(
    charts: &BTreeMap<String, ChartRenderResult>,
    chart_id: String,
    position: usize,
) -> String {
    if !charts.contains_key(&chart_id) {
        return chart_id;
    }
    warn!(chart_id = %chart_id, position, "duplicate chart id in dashboard");
    format!("{chart_id}#{position}")
}

struct RendererInner {
    store: Arc<dyn DashboardStore>,
    executor: Arc<dyn QueryExecutor>,
    data_cache: DataSourceCache,
    transformers: TransformerRegistry,
    hasher: QuerySignatureHasher,
    max_parallel_charts: Option<usize>,
}

/// Renders dashboards. Cheap to clone; clones share collaborators and caches.
#[derive(Clone)]
pub struct DashboardRenderer {
    inner: Arc<RendererInner>,
}

impl fmt::Debug for DashboardRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DashboardRenderer")
            .field("store", &self.inner.store)
            .field("executor", &self.inner.executor)
            .field("transformers", &self.inner.transformers)
            .field("max_parallel_charts", &self.inner.max_parallel_charts)
            .finish()
    }
}

impl DashboardRenderer {
    /// Fetch-grouping chart types are the union of what the transformers declare
    /// and `config.fetch_grouping_chart_types`.
    pub fn new(
        store: Arc<dyn DashboardStore>,
        executor: Arc<dyn QueryExecutor>,
        data_cache: DataSourceCache,
        transformers: TransformerRegistry,
        config: &RenderConfig,
    ) -> Self {
        let hasher = QuerySignatureHasher::new(
            transformers
                .fetch_grouping_chart_types()
                .into_iter()
                .chain(config.fetch_grouping_chart_types.iter().cloned()),
        );
        Self {
            inner: Arc::new(RendererInner {
                store,
                executor,
                data_cache,
                transformers,
                hasher,
                max_parallel_charts: config.max_parallel_charts.map(|n| n.max(1)),
            }),
        }
    }

    pub fn hasher(&self) -> &QuerySignatureHasher {
        &self.inner.hasher
    }

    /// Render every chart of a dashboard for one caller.
    #[tracing::instrument(
        name = "render_dashboard",
        skip(self, request),
        fields(
            dashrender.dashboard_id = %request.dashboard_id,
            dashrender.user_id = %request.access.user_id,
            dashrender.phase = tracing::field::Empty,
            dashrender.universal_filters = tracing::field::Empty,
            dashrender.chart_count = tracing::field::Empty,
            dashrender.unique_queries = tracing::field::Empty,
            dashrender.deduplicated_queries = tracing::field::Empty,
        )
    )]
    pub async fn render(&self, request: RenderRequest) -> Result<DashboardRenderResponse, RenderError> {
        let start = Instant::now();
        enter_phase(RenderPhase::Init);
        if crate::telemetry::include_filters_in_traces() {
            if let Ok(filters) = serde_json::to_string(&request.universal_filters) {
                tracing::Span::current().record("dashrender.universal_filters", filters.as_str());
            }
        }

        let dashboard = self
            .inner
            .store
            .get_dashboard(&request.dashboard_id)
            .await
            .map_err(|e| RenderError::Store(e.to_string()))?
            .ok_or_else(|| RenderError::DashboardNotFound(request.dashboard_id.clone()))?;

        if !request.access.can_view_dashboard(&dashboard) {
            warn!(
                dashboard_id = %request.dashboard_id,
                user_id = %request.access.user_id,
                "render denied"
            );
            return Err(RenderError::AccessDenied {
                dashboard_id: request.dashboard_id,
                user_id: request.access.user_id,
            });
        }

        let specs: Vec<ChartSpecification> = dashboard
            .charts
            .iter()
            .map(|chart| {
                resolve_chart(
                    chart,
                    &dashboard.default_filters,
                    &request.universal_filters,
                    &request.access,
                )
            })
            .collect();
        tracing::Span::current().record("dashrender.chart_count", specs.len());
        enter_phase(RenderPhase::FiltersResolved);

        let dedup = QueryDeduplicator::new();
        enter_phase(RenderPhase::Dispatched);
        let pipelines: Vec<_> = specs
            .iter()
            .enumerate()
            .map(|(position, spec)| self.render_chart(spec, &dedup).map(move |o| (position, o)))
            .collect();
        let limit = self
            .inner
            .max_parallel_charts
            .unwrap_or(pipelines.len())
            .max(1);
        let mut outcomes: Vec<(usize, ChartOutcome)> = futures::stream::iter(pipelines)
            .buffer_unordered(limit)
            .collect()
            .await;
        outcomes.sort_unstable_by_key(|(position, _)| *position);
        enter_phase(RenderPhase::Collected);

        let mut charts = BTreeMap::new();
        let (mut succeeded, mut failed, mut hits, mut misses) = (0, 0, 0, 0);
        for (position, outcome) in outcomes {
            if outcome.result.is_success() {
                succeeded += 1;
            } else {
                failed += 1;
            }
            // Deduplicated requests never touched the cache themselves.
            if let Some(query) = outcome.query.filter(|q| !q.deduplicated) {
                if query.cache.is_hit() {
                    hits += 1;
                } else {
                    misses += 1;
                }
            }
            let key = result_key(&charts, outcome.chart_id, position);
            charts.insert(key, outcome.result);
        }

        let unique_queries = dedup.unique_queries();
        let deduplicated_queries = dedup.deduplicated_queries();
        drop(dedup);

        let metadata = RenderMetadata {
            total_time_ms: start.elapsed().as_millis() as u64,
            chart_count: charts.len(),
            charts_succeeded: succeeded,
            charts_failed: failed,
            unique_queries,
            deduplicated_queries,
            dedup_rate: ratio(deduplicated_queries, unique_queries + deduplicated_queries),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: ratio(hits, hits + misses),
        };

        tracing::Span::current()
            .record("dashrender.unique_queries", unique_queries)
            .record("dashrender.deduplicated_queries", deduplicated_queries);
        enter_phase(RenderPhase::Done);
        info!(
            dashboard_id = %request.dashboard_id,
            charts = metadata.chart_count,
            failed = metadata.charts_failed,
            unique_queries,
            deduplicated_queries,
            cache_hits = hits,
            elapsed_ms = metadata.total_time_ms,
            "dashboard rendered"
        );

        Ok(DashboardRenderResponse {
            dashboard_id: request.dashboard_id,
            charts,
            metadata,
        })
    }

    /// Run one chart through signature, query and transform. Never fails: errors
    /// and panics become the chart's error entry.
    async fn render_chart(&self, spec: &ChartSpecification, dedup: &QueryDeduplicator) -> ChartOutcome {
        let pipeline = async {
            if !self.inner.transformers.supports(&spec.chart_type) {
                return ChartOutcome::failed(
                    &spec.chart_id,
                    ChartErrorKind::Transform,
                    TransformError::UnsupportedChartType(spec.chart_type.clone()).to_string(),
                );
            }

            let query = self.inner.hasher.data_query(spec);
            let signature = self.inner.hasher.signature(&query);

            let inner = Arc::clone(&self.inner);
            let query_signature = signature.clone();
            let resolved = dedup
                .resolve(&signature, move || async move {
                    let started = Instant::now();
                    if query.is_empty_scope() {
                        return Ok(QueryOutput {
                            rows: Arc::new(Vec::new()),
                            cache: CacheOutcome::Bypassed,
                            query_time: started.elapsed(),
                        });
                    }
                    let result = inner
                        .data_cache
                        .get_or_execute(&query_signature, &query, || {
                            inner.executor.execute_query(&query)
                        })
                        .await?;
                    Ok(QueryOutput {
                        rows: Arc::new(result.rows),
                        cache: result.outcome,
                        query_time: started.elapsed(),
                    })
                })
                .await;

            let resolved = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(chart_id = %spec.chart_id, signature = %signature, error = %e, "chart query failed");
                    return ChartOutcome::failed(&spec.chart_id, ChartErrorKind::Query, e.to_string());
                }
            };

            let query_stats = QueryStats {
                cache: resolved.output.cache,
                deduplicated: resolved.deduplicated,
            };
            let rows = &resolved.output.rows;
            let result = match self.inner.transformers.transform(&spec.chart_type, rows, spec) {
                Ok(data) => ChartRenderResult::Success {
                    chart_type: spec.chart_type.clone(),
                    data,
                    metadata: ChartResultMetadata {
                        row_count: rows.len(),
                        query_time_ms: resolved.output.query_time.as_millis() as u64,
                        cache_hit: resolved.output.cache.is_hit(),
                        deduplicated: resolved.deduplicated,
                        signature,
                    },
                },
                Err(e) => {
                    warn!(chart_id = %spec.chart_id, error = %e, "chart transform failed");
                    ChartRenderResult::error(ChartErrorKind::Transform, e.to_string())
                }
            };

            ChartOutcome {
                chart_id: spec.chart_id.clone(),
                result,
                query: Some(query_stats),
            }
        };

        match AssertUnwindSafe(pipeline).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(chart_id = %spec.chart_id, "chart pipeline panicked");
                ChartOutcome::failed(&spec.chart_id, ChartErrorKind::Internal, "chart rendering panicked")
            }
        }
    }
}
