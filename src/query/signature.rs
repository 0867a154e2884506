//! Content hash identifying the underlying data query of a chart.

use super::{normalize_advanced_filter, DataQuery};
use crate::dashboard::ChartSpecification;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Lowercase hex SHA-256 of a canonicalised [`DataQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuerySignature(String);

impl QuerySignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives data queries and their signatures from chart specifications.
///
/// Only fetch-affecting fields participate. Chart type, colours and stacking never
/// do; display grouping does only for chart types registered as fetch-grouping.
#[derive(Debug, Clone, Default)]
pub struct QuerySignatureHasher {
    fetch_grouping_chart_types: HashSet<String>,
}

impl QuerySignatureHasher {
    pub fn new<I, S>(fetch_grouping_chart_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fetch_grouping_chart_types: fetch_grouping_chart_types
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }

    pub fn group_by_affects_fetch(&self, chart_type: &str) -> bool {
        self.fetch_grouping_chart_types.contains(chart_type)
    }

    /// Extract the canonical fetch-affecting query from a chart specification.
    pub fn data_query(&self, spec: &ChartSpecification) -> DataQuery {
        let filters = &spec.filters;

        let practice_uids = filters.practice_uids.as_ref().map(|uids| {
            let mut uids = uids.clone();
            uids.sort_unstable();
            uids.dedup();
            uids
        });

        let mut advanced_filters: Vec<_> = filters
            .advanced_filters
            .iter()
            .flatten()
            .map(normalize_advanced_filter)
            .collect();
        advanced_filters.sort_by_cached_key(|f| {
            serde_json::to_string(&canonical_json(&serde_json::json!(f))).unwrap_or_default()
        });
        advanced_filters.dedup();

        let group_by = if self.group_by_affects_fetch(&spec.chart_type) {
            spec.presentation.group_by.clone()
        } else {
            None
        };

        DataQuery {
            data_source_id: spec.data_source_id,
            measure: filters.measure.clone(),
            frequency: filters.frequency.clone(),
            start_date: filters.start_date,
            end_date: filters.end_date,
            practice_uids,
            provider_name: filters.provider_name.clone(),
            advanced_filters,
            scope: spec.scope.clone(),
            group_by,
        }
    }

    /// Signature of an already-extracted query.
    pub fn signature(&self, query: &DataQuery) -> QuerySignature {
        let canonical = canonical_json(&serde_json::json!(query));
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        QuerySignature(hex::encode(hasher.finalize()))
    }

    /// Signature of a chart specification.
    pub fn hash(&self, spec: &ChartSpecification) -> QuerySignature {
        self.signature(&self.data_query(spec))
    }
}

/// Recursively rebuild a JSON value with object keys in sorted order.
pub(crate) fn canonical_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonical_json(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(canonical_json).collect())
        }
        other => other.clone(),
    }
}
