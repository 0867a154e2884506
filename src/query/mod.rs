//! Analytics query model and the executor seam.

mod signature;

pub use signature::{QuerySignature, QuerySignatureHasher};

use crate::access::AccessScope;
use crate::dashboard::{AdvancedFilter, FilterOperator};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

/// One result row from the analytics store.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The fetch-affecting part of a chart request.
///
/// This is both what gets hashed into a [`QuerySignature`] and what the executor
/// runs, so two charts with equal signatures always issue the same query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQuery {
    pub data_source_id: i64,
    pub measure: Option<String>,
    pub frequency: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Sorted, deduplicated. `None` only for unrestricted callers with no practice filter.
    pub practice_uids: Option<Vec<i64>>,
    pub provider_name: Option<String>,
    /// Sorted by canonical form.
    pub advanced_filters: Vec<AdvancedFilter>,
    pub scope: AccessScope,
    /// Present only for chart types whose grouping changes the rows fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

impl DataQuery {
    /// True when the caller is scoped to an empty set of practices; such a query
    /// can never return rows.
    pub fn is_empty_scope(&self) -> bool {
        matches!(&self.practice_uids, Some(p) if p.is_empty())
    }
}

/// Errors from analytics query execution. Cloneable so one failure can be
/// delivered to every chart waiting on the same query.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The analytics store rejected or failed the query
    #[error("query failed: {0}")]
    Execution(String),

    /// The query could not be built (unknown data source, bad filter value)
    #[error("invalid query: {0}")]
    Invalid(String),

    /// The task running the query panicked or was cancelled
    #[error("query task aborted: {0}")]
    Aborted(String),
}

impl From<sqlx::Error> for QueryError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => QueryError::Invalid(e.to_string()),
            _ => QueryError::Execution(e.to_string()),
        }
    }
}

/// Runs a resolved query against the analytics store.
#[async_trait]
pub trait QueryExecutor: Debug + Send + Sync {
    async fn execute_query(&self, query: &DataQuery) -> Result<Vec<Row>, QueryError>;
}

/// Put an advanced filter into canonical form: set-valued operators get their
/// values sorted so `IN (a, b)` and `IN (b, a)` compare equal.
pub(crate) fn normalize_advanced_filter(filter: &AdvancedFilter) -> AdvancedFilter {
    let mut filter = filter.clone();
    filter.value = signature::canonical_json(&filter.value);
    if matches!(filter.operator, FilterOperator::In | FilterOperator::NotIn) {
        if let serde_json::Value::Array(values) = &mut filter.value {
            values.sort_by_key(|v| v.to_string());
            values.dedup();
        }
    }
    filter
}
