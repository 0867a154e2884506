use super::{AdvancedFilter, ChartDefinition, ChartFilters, ChartSpecification};
use crate::access::AccessContext;

/// Overlay `overrides` on top of `base`, key by key.
///
/// Advanced filters are merged by field: a field present in `overrides` replaces
/// every `base` filter on that field.
pub fn merge_filters(base: &ChartFilters, overrides: &ChartFilters) -> ChartFilters {
    ChartFilters {
        measure: overrides.measure.clone().or_else(|| base.measure.clone()),
        frequency: overrides.frequency.clone().or_else(|| base.frequency.clone()),
        start_date: overrides.start_date.or(base.start_date),
        end_date: overrides.end_date.or(base.end_date),
        practice_uids: overrides
            .practice_uids
            .clone()
            .or_else(|| base.practice_uids.clone()),
        provider_name: overrides
            .provider_name
            .clone()
            .or_else(|| base.provider_name.clone()),
        advanced_filters: merge_advanced(
            base.advanced_filters.as_deref(),
            overrides.advanced_filters.as_deref(),
        ),
    }
}

fn merge_advanced(
    base: Option<&[AdvancedFilter]>,
    overrides: Option<&[AdvancedFilter]>,
) -> Option<Vec<AdvancedFilter>> {
    match (base, overrides) {
        (None, None) => None,
        (Some(base), None) => Some(base.to_vec()),
        (None, Some(overrides)) => Some(overrides.to_vec()),
        (Some(base), Some(overrides)) => {
            let mut merged: Vec<AdvancedFilter> = base
                .iter()
                .filter(|b| !overrides.iter().any(|o| o.field == b.field))
                .cloned()
                .collect();
            merged.extend(overrides.iter().cloned());
            Some(merged)
        }
    }
}

/// Resolve a stored chart into a render-ready specification.
///
/// Precedence, lowest to highest: dashboard defaults, request-level universal
/// filters, chart filters. Practice uids are then restricted to the caller's scope.
pub fn resolve_chart(
    chart: &ChartDefinition,
    dashboard_defaults: &ChartFilters,
    universal: &ChartFilters,
    access: &AccessContext,
) -> ChartSpecification {
    let dashboard_level = merge_filters(dashboard_defaults, universal);
    let mut filters = merge_filters(&dashboard_level, &chart.filters);

    let practices = access.restrict_practices(filters.practice_uids.as_deref());
    filters.practice_uids = if practices.is_empty() && access.is_super_admin {
        None
    } else {
        Some(practices)
    };

    ChartSpecification {
        chart_id: chart.chart_id.clone(),
        chart_name: chart.chart_name.clone(),
        chart_type: chart.chart_type.clone(),
        data_source_id: chart.data_source_id,
        filters,
        scope: access.scope(),
        presentation: chart.presentation.clone(),
        config: chart.config.clone(),
    }
}
