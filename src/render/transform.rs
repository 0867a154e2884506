//! Chart-type specific shaping of query rows into render-ready data.

use crate::dashboard::ChartSpecification;
use crate::query::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_DATE_FIELD: &str = "date_index";
const DEFAULT_VALUE_FIELD: &str = "measure_value";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub label: String,
    pub data: Vec<f64>,
}

/// Render-ready chart payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChartData {
    Series {
        labels: Vec<String>,
        datasets: Vec<Dataset>,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<Row>,
    },
    Metric {
        value: f64,
        row_count: usize,
    },
}

#[derive(Debug, Clone, Error)]
pub enum TransformError {
    #[error("unsupported chart type '{0}'")]
    UnsupportedChartType(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Turns the rows of a query into the payload for one chart type.
pub trait ChartTransformer: Send + Sync {
    fn transform(&self, rows: &[Row], spec: &ChartSpecification) -> Result<ChartData, TransformError>;

    /// Whether `presentation.group_by` changes the rows this chart type needs.
    /// When true, the grouping is part of the query signature.
    fn group_by_affects_fetch(&self) -> bool {
        false
    }
}

/// Chart type name -> transformer.
#[derive(Clone)]
pub struct TransformerRegistry {
    transformers: HashMap<String, Arc<dyn ChartTransformer>>,
}

impl fmt::Debug for TransformerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.transformers.keys().collect();
        types.sort();
        f.debug_struct("TransformerRegistry")
            .field("chart_types", &types)
            .finish()
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl TransformerRegistry {
    pub fn empty() -> Self {
        Self {
            transformers: HashMap::new(),
        }
    }

    /// Registry with the built-in chart types.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        let series: Arc<dyn ChartTransformer> = Arc::new(SeriesTransformer);
        for chart_type in ["line", "area", "bar", "stacked-bar", "horizontal-bar"] {
            registry.register_arc(chart_type, series.clone());
        }
        let category: Arc<dyn ChartTransformer> = Arc::new(CategoryTransformer);
        for chart_type in ["pie", "doughnut"] {
            registry.register_arc(chart_type, category.clone());
        }
        registry.register("number", MetricTransformer);
        registry.register("table", TableTransformer);
        registry
    }

    pub fn register(&mut self, chart_type: impl Into<String>, transformer: impl ChartTransformer + 'static) {
        self.register_arc(chart_type, Arc::new(transformer));
    }

    pub fn register_arc(&mut self, chart_type: impl Into<String>, transformer: Arc<dyn ChartTransformer>) {
        self.transformers.insert(chart_type.into(), transformer);
    }

    pub fn supports(&self, chart_type: &str) -> bool {
        self.transformers.contains_key(chart_type)
    }

    /// Chart types whose transformer declares grouping as fetch-affecting.
    pub fn fetch_grouping_chart_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .transformers
            .iter()
            .filter(|(_, t)| t.group_by_affects_fetch())
            .map(|(name, _)| name.clone())
            .collect();
        types.sort();
        types
    }

    pub fn transform(
        &self,
        chart_type: &str,
        rows: &[Row],
        spec: &ChartSpecification,
    ) -> Result<ChartData, TransformError> {
        let transformer = self
            .transformers
            .get(chart_type)
            .ok_or_else(|| TransformError::UnsupportedChartType(chart_type.to_string()))?;
        transformer.transform(rows, spec)
    }
}

fn config_field<'a>(spec: &'a ChartSpecification, key: &str, default: &'a str) -> &'a str {
    spec.config
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
}

/// Numbers, or strings holding numbers (Postgres NUMERIC arrives as a string).
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn row_value(row: &Row, field: &str) -> Result<f64, TransformError> {
    match row.get(field) {
        None | Some(Value::Null) => Ok(0.0),
        Some(v) => numeric(v).ok_or_else(|| {
            TransformError::InvalidData(format!("field '{field}' is not numeric: {v}"))
        }),
    }
}

/// Time series: x axis from the date field, one dataset per group.
#[derive(Debug, Clone, Copy)]
pub struct SeriesTransformer;

impl ChartTransformer for SeriesTransformer {
    fn transform(&self, rows: &[Row], spec: &ChartSpecification) -> Result<ChartData, TransformError> {
        let date_field = config_field(spec, "date_field", DEFAULT_DATE_FIELD);
        let value_field = config_field(spec, "value_field", DEFAULT_VALUE_FIELD);
        let group_field = spec.presentation.group_by.as_deref();

        let mut totals: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        let mut labels: Vec<String> = Vec::new();

        for row in rows {
            let x = row.get(date_field).map(label).ok_or_else(|| {
                TransformError::InvalidData(format!("row has no '{date_field}' field"))
            })?;
            let group = match group_field {
                Some(field) => row.get(field).map(label).unwrap_or_default(),
                None => spec.chart_name.clone(),
            };
            let value = row_value(row, value_field)?;

            if !labels.contains(&x) {
                labels.push(x.clone());
            }
            *totals.entry(group).or_default().entry(x).or_insert(0.0) += value;
        }

        labels.sort();
        let datasets = totals
            .into_iter()
            .map(|(group, points)| Dataset {
                label: group,
                data: labels
                    .iter()
                    .map(|x| points.get(x).copied().unwrap_or(0.0))
                    .collect(),
            })
            .collect();

        Ok(ChartData::Series { labels, datasets })
    }
}

/// Category totals (pie, doughnut): one slice per group.
#[derive(Debug, Clone, Copy)]
pub struct CategoryTransformer;

impl ChartTransformer for CategoryTransformer {
    fn transform(&self, rows: &[Row], spec: &ChartSpecification) -> Result<ChartData, TransformError> {
        let value_field = config_field(spec, "value_field", DEFAULT_VALUE_FIELD);
        let group_field = spec.presentation.group_by.as_deref().ok_or_else(|| {
            TransformError::InvalidData(format!(
                "chart type '{}' requires presentation.group_by",
                spec.chart_type
            ))
        })?;

        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for row in rows {
            let category = row.get(group_field).map(label).unwrap_or_default();
            *totals.entry(category).or_insert(0.0) += row_value(row, value_field)?;
        }

        let (labels, data) = totals.into_iter().unzip();
        Ok(ChartData::Series {
            labels,
            datasets: vec![Dataset {
                label: spec.chart_name.clone(),
                data,
            }],
        })
    }
}

/// Single number: sum of the value field.
#[derive(Debug, Clone, Copy)]
pub struct MetricTransformer;

impl ChartTransformer for MetricTransformer {
    fn transform(&self, rows: &[Row], spec: &ChartSpecification) -> Result<ChartData, TransformError> {
        let value_field = config_field(spec, "value_field", DEFAULT_VALUE_FIELD);
        let value = rows
            .iter()
            .map(|row| row_value(row, value_field))
            .sum::<Result<f64, _>>()?;
        Ok(ChartData::Metric {
            value,
            row_count: rows.len(),
        })
    }
}

/// Rows passed through, optionally restricted to `config.columns`.
#[derive(Debug, Clone, Copy)]
pub struct TableTransformer;

impl ChartTransformer for TableTransformer {
    fn transform(&self, rows: &[Row], spec: &ChartSpecification) -> Result<ChartData, TransformError> {
        let configured: Option<Vec<String>> = spec
            .config
            .get("columns")
            .and_then(Value::as_array)
            .map(|cols| cols.iter().filter_map(Value::as_str).map(String::from).collect());

        let columns = match configured {
            Some(cols) => cols,
            None => rows
                .first()
                .map(|row| row.keys().cloned().collect())
                .unwrap_or_default(),
        };

        let rows = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();

        Ok(ChartData::Table { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessScope;
    use crate::dashboard::{ChartFilters, Presentation};
    use serde_json::json;

    fn spec(chart_type: &str, group_by: Option<&str>, config: Value) -> ChartSpecification {
        ChartSpecification {
            chart_id: "c1".to_string(),
            chart_name: "Charges".to_string(),
            chart_type: chart_type.to_string(),
            data_source_id: 1,
            filters: ChartFilters::default(),
            scope: AccessScope::All,
            presentation: Presentation {
                group_by: group_by.map(String::from),
                ..Default::default()
            },
            config,
        }
    }

    fn rows(values: Value) -> Vec<Row> {
        serde_json::from_value(values).unwrap()
    }

    fn sample() -> Vec<Row> {
        rows(json!([
            {"date_index": "2024-02-01", "provider_name": "Dr. B", "measure_value": "25.5"},
            {"date_index": "2024-01-01", "provider_name": "Dr. A", "measure_value": 10},
            {"date_index": "2024-01-01", "provider_name": "Dr. B", "measure_value": 5},
            {"date_index": "2024-02-01", "provider_name": "Dr. A", "measure_value": null},
        ]))
    }

    #[test]
    fn test_series_single_dataset() {
        let registry = TransformerRegistry::with_builtin();
        let data = registry
            .transform("line", &sample(), &spec("line", None, json!({})))
            .unwrap();
        assert_eq!(
            data,
            ChartData::Series {
                labels: vec!["2024-01-01".to_string(), "2024-02-01".to_string()],
                datasets: vec![Dataset {
                    label: "Charges".to_string(),
                    data: vec![15.0, 25.5],
                }],
            }
        );
    }

    #[test]
    fn test_series_grouped_fills_missing_points() {
        let registry = TransformerRegistry::with_builtin();
        let mut input = sample();
        input.pop();
        let data = registry
            .transform("stacked-bar", &input, &spec("stacked-bar", Some("provider_name"), json!({})))
            .unwrap();
        let ChartData::Series { labels, datasets } = data else {
            panic!("expected series");
        };
        assert_eq!(labels.len(), 2);
        assert_eq!(datasets[0].label, "Dr. A");
        assert_eq!(datasets[0].data, vec![10.0, 0.0]);
        assert_eq!(datasets[1].label, "Dr. B");
        assert_eq!(datasets[1].data, vec![5.0, 25.5]);
    }

    #[test]
    fn test_series_rejects_rows_without_date() {
        let registry = TransformerRegistry::with_builtin();
        let err = registry
            .transform("bar", &rows(json!([{"measure_value": 1}])), &spec("bar", None, json!({})))
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidData(m) if m.contains("date_index")));
    }

    #[test]
    fn test_configured_fields() {
        let registry = TransformerRegistry::with_builtin();
        let input = rows(json!([{"month": "Jan", "total": 4}, {"month": "Jan", "total": 6}]));
        let data = registry
            .transform(
                "area",
                &input,
                &spec("area", None, json!({"date_field": "month", "value_field": "total"})),
            )
            .unwrap();
        let ChartData::Series { datasets, .. } = data else {
            panic!("expected series");
        };
        assert_eq!(datasets[0].data, vec![10.0]);
    }

    #[test]
    fn test_category_totals() {
        let registry = TransformerRegistry::with_builtin();
        let data = registry
            .transform("pie", &sample(), &spec("pie", Some("provider_name"), json!({})))
            .unwrap();
        let ChartData::Series { labels, datasets } = data else {
            panic!("expected series");
        };
        assert_eq!(labels, vec!["Dr. A", "Dr. B"]);
        assert_eq!(datasets[0].data, vec![10.0, 30.5]);

        let err = registry
            .transform("doughnut", &sample(), &spec("doughnut", None, json!({})))
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidData(_)));
    }

    #[test]
    fn test_metric_sum() {
        let registry = TransformerRegistry::with_builtin();
        let data = registry
            .transform("number", &sample(), &spec("number", None, json!({})))
            .unwrap();
        assert_eq!(
            data,
            ChartData::Metric {
                value: 40.5,
                row_count: 4
            }
        );

        let err = registry
            .transform(
                "number",
                &rows(json!([{"measure_value": "n/a"}])),
                &spec("number", None, json!({})),
            )
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidData(_)));
    }

    #[test]
    fn test_table_columns() {
        let registry = TransformerRegistry::with_builtin();
        let data = registry
            .transform(
                "table",
                &sample(),
                &spec("table", None, json!({"columns": ["provider_name", "missing"]})),
            )
            .unwrap();
        let ChartData::Table { columns, rows } = data else {
            panic!("expected table");
        };
        assert_eq!(columns, vec!["provider_name", "missing"]);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["provider_name"], json!("Dr. B"));
        assert_eq!(rows[0]["missing"], Value::Null);
    }

    #[test]
    fn test_unknown_chart_type() {
        let registry = TransformerRegistry::with_builtin();
        assert!(!registry.supports("radar"));
        let err = registry
            .transform("radar", &sample(), &spec("radar", None, json!({})))
            .unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedChartType(t) if t == "radar"));
    }

    #[test]
    fn test_fetch_grouping_types_from_transformers() {
        struct GroupedTable;
        impl ChartTransformer for GroupedTable {
            fn transform(&self, rows: &[Row], spec: &ChartSpecification) -> Result<ChartData, TransformError> {
                TableTransformer.transform(rows, spec)
            }
            fn group_by_affects_fetch(&self) -> bool {
                true
            }
        }

        let mut registry = TransformerRegistry::with_builtin();
        assert!(registry.fetch_grouping_chart_types().is_empty());
        registry.register("pivot-table", GroupedTable);
        assert_eq!(registry.fetch_grouping_chart_types(), vec!["pivot-table"]);
    }
}
