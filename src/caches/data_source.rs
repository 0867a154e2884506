//! Cached analytics query results, keyed by query signature.

use super::{CacheNamespace, CacheOutcome, EntityCache};
use crate::config::TtlConfig;
use crate::query::{DataQuery, QueryError, QuerySignature, Row};
use chrono::{NaiveDate, Utc};
use std::future::Future;
use std::time::Duration;

/// Rows of one executed (or cached) query and how they were obtained.
#[derive(Debug, Clone)]
pub struct DataSourceResult {
    pub rows: Vec<Row>,
    pub outcome: CacheOutcome,
}

/// TTL for a query result, by how recent the requested date range is.
///
/// Ranges reaching today (or open-ended) change during the day and get the
/// shortest TTL; ranges that ended within the last week may still receive late
/// postings; older ranges are effectively immutable.
pub fn data_source_ttl(end_date: Option<NaiveDate>, today: NaiveDate, ttl: &TtlConfig) -> Duration {
    let secs = match end_date {
        None => ttl.data_source_current_secs,
        Some(end) if end >= today => ttl.data_source_current_secs,
        Some(end) if (today - end).num_days() <= 7 => ttl.data_source_recent_secs,
        Some(_) => ttl.data_source_historical_secs,
    };
    Duration::from_secs(secs)
}

#[derive(Debug, Clone)]
pub struct DataSourceCache {
    cache: EntityCache,
    ttl: TtlConfig,
}

impl DataSourceCache {
    pub fn new(cache: EntityCache, ttl: &TtlConfig) -> Self {
        Self {
            cache,
            ttl: ttl.clone(),
        }
    }

    /// Return cached rows for `signature`, or run `execute` and cache its rows.
    pub async fn get_or_execute<F, Fut>(
        &self,
        signature: &QuerySignature,
        query: &DataQuery,
        execute: F,
    ) -> Result<DataSourceResult, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Row>, QueryError>>,
    {
        let ttl = data_source_ttl(query.end_date, Utc::now().date_naive(), &self.ttl);
        let (rows, outcome) = self
            .cache
            .get_or_compute(
                CacheNamespace::DataSource,
                signature.as_str(),
                |_: &Vec<Row>| Some(ttl),
                execute,
            )
            .await?;
        Ok(DataSourceResult { rows, outcome })
    }

    /// Drop cached results for a known set of signatures (e.g. after a data reload).
    pub async fn invalidate(&self, signatures: &[QuerySignature]) {
        let ids: Vec<&str> = signatures.iter().map(|s| s.as_str()).collect();
        self.cache
            .invalidate_many(CacheNamespace::DataSource, &ids)
            .await;
    }
}
