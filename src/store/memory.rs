//! In-process stores for single-instance deployments and tests.

use crate::caches::{
    RbacStore, RolePermissions, TokenBlacklistStore, UserBasicInfo, UserContext,
};
use crate::dashboard::{AdvancedFilter, DashboardDefinition, DashboardStore, FilterOperator};
use crate::query::{DataQuery, QueryError, QueryExecutor, Row};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dashboard definitions held in memory, with a failure switch for tests.
#[derive(Debug, Default)]
pub struct InMemoryDashboardStore {
    dashboards: Mutex<HashMap<String, DashboardDefinition>>,
    fail: AtomicBool,
}

impl InMemoryDashboardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dashboard: DashboardDefinition) {
        locked(&self.dashboards).insert(dashboard.dashboard_id.clone(), dashboard);
    }

    pub fn remove(&self, dashboard_id: &str) -> Option<DashboardDefinition> {
        locked(&self.dashboards).remove(dashboard_id)
    }

    /// Make every lookup fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DashboardStore for InMemoryDashboardStore {
    async fn get_dashboard(&self, dashboard_id: &str) -> Result<Option<DashboardDefinition>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("dashboard store unavailable");
        }
        Ok(locked(&self.dashboards).get(dashboard_id).cloned())
    }
}

/// RBAC entities held in memory. Counts every load so tests can tell cache hits
/// from source reads.
#[derive(Debug, Default)]
pub struct InMemoryRbacStore {
    users: Mutex<HashMap<String, UserContext>>,
    user_basics: Mutex<HashMap<String, UserBasicInfo>>,
    roles: Mutex<HashMap<String, RolePermissions>>,
    user_context_loads: AtomicUsize,
    role_loads: AtomicUsize,
    user_basic_loads: AtomicUsize,
}

impl InMemoryRbacStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, context: UserContext) {
        locked(&self.users).insert(context.user_id.clone(), context);
    }

    pub fn insert_user_basic(&self, info: UserBasicInfo) {
        locked(&self.user_basics).insert(info.user_id.clone(), info);
    }

    pub fn insert_role(&self, role: RolePermissions) {
        locked(&self.roles).insert(role.role_id.clone(), role);
    }

    pub fn user_context_loads(&self) -> usize {
        self.user_context_loads.load(Ordering::SeqCst)
    }

    pub fn role_loads(&self) -> usize {
        self.role_loads.load(Ordering::SeqCst)
    }

    pub fn user_basic_loads(&self) -> usize {
        self.user_basic_loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RbacStore for InMemoryRbacStore {
    async fn load_user_context(&self, user_id: &str) -> Result<Option<UserContext>> {
        self.user_context_loads.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.users).get(user_id).cloned())
    }

    async fn load_role_permissions(&self, role_id: &str) -> Result<Option<RolePermissions>> {
        self.role_loads.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.roles).get(role_id).cloned())
    }

    async fn load_user_basic(&self, user_id: &str) -> Result<Option<UserBasicInfo>> {
        self.user_basic_loads.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.user_basics).get(user_id).cloned())
    }
}

/// Revoked tokens, keyed by token id, with the time the token itself expires.
#[derive(Debug, Default)]
pub struct InMemoryTokenBlacklistStore {
    tokens: Mutex<HashMap<String, DateTime<Utc>>>,
    checks: AtomicUsize,
}

impl InMemoryTokenBlacklistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `is_blacklisted` calls that reached the store.
    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    /// Forget entries for tokens that have expired anyway. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut tokens = locked(&self.tokens);
        let before = tokens.len();
        tokens.retain(|_, expires_at| *expires_at > now);
        before - tokens.len()
    }
}

#[async_trait]
impl TokenBlacklistStore for InMemoryTokenBlacklistStore {
    async fn is_blacklisted(&self, token_id: &str) -> Result<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.tokens).contains_key(token_id))
    }

    async fn blacklist_token(
        &self,
        token_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        tracing::debug!(token_id = %token_id, user_id = %user_id, "blacklisting token");
        locked(&self.tokens).insert(token_id.to_string(), expires_at);
        Ok(())
    }
}

/// Executes queries over rows held in memory, one table per data source.
///
/// Rows are matched on the conventional columns `measure`, `frequency`,
/// `practice_uid`, `provider_name` and `date_index` when present, plus every
/// advanced filter.
#[derive(Debug, Default)]
pub struct InMemoryQueryExecutor {
    tables: Mutex<HashMap<i64, Vec<Row>>>,
    failing: Mutex<HashSet<i64>>,
    latency: Mutex<Option<Duration>>,
    executions: AtomicUsize,
}

impl InMemoryQueryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rows(&self, data_source_id: i64, rows: Vec<Row>) {
        locked(&self.tables)
            .entry(data_source_id)
            .or_default()
            .extend(rows);
    }

    /// Make every query against `data_source_id` fail.
    pub fn fail_data_source(&self, data_source_id: i64) {
        locked(&self.failing).insert(data_source_id);
    }

    /// Delay every query, so concurrent requests overlap.
    pub fn set_latency(&self, latency: Duration) {
        *locked(&self.latency) = Some(latency);
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryExecutor for InMemoryQueryExecutor {
    async fn execute_query(&self, query: &DataQuery) -> Result<Vec<Row>, QueryError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let latency = *locked(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if locked(&self.failing).contains(&query.data_source_id) {
            return Err(QueryError::Execution(format!(
                "data source {} is unavailable",
                query.data_source_id
            )));
        }

        let tables = locked(&self.tables);
        let rows = tables.get(&query.data_source_id).ok_or_else(|| {
            QueryError::Invalid(format!("unknown data source {}", query.data_source_id))
        })?;

        Ok(rows
            .iter()
            .filter(|row| row_matches(row, query))
            .cloned()
            .collect())
    }
}

fn row_matches(row: &Row, query: &DataQuery) -> bool {
    let text_matches = |field: &str, expected: &Option<String>| match (expected, row.get(field)) {
        (Some(expected), Some(Value::String(actual))) => actual == expected,
        _ => true,
    };
    if !text_matches("measure", &query.measure)
        || !text_matches("frequency", &query.frequency)
        || !text_matches("provider_name", &query.provider_name)
    {
        return false;
    }

    if let (Some(practices), Some(practice)) = (
        &query.practice_uids,
        row.get("practice_uid").and_then(Value::as_i64),
    ) {
        if !practices.is_empty() && !practices.contains(&practice) {
            return false;
        }
    }

    if let Some(date) = row
        .get("date_index")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<NaiveDate>().ok())
    {
        if query.start_date.is_some_and(|start| date < start)
            || query.end_date.is_some_and(|end| date > end)
        {
            return false;
        }
    }

    query
        .advanced_filters
        .iter()
        .all(|filter| filter_matches(row.get(&filter.field).unwrap_or(&Value::Null), filter))
}

fn compare(actual: &Value, expected: &Value) -> Option<CmpOrdering> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn filter_matches(actual: &Value, filter: &AdvancedFilter) -> bool {
    let expected = &filter.value;
    match filter.operator {
        FilterOperator::Eq => actual == expected,
        FilterOperator::Neq => actual != expected,
        FilterOperator::Gt => compare(actual, expected) == Some(CmpOrdering::Greater),
        FilterOperator::Gte => matches!(
            compare(actual, expected),
            Some(CmpOrdering::Greater | CmpOrdering::Equal)
        ),
        FilterOperator::Lt => compare(actual, expected) == Some(CmpOrdering::Less),
        FilterOperator::Lte => matches!(
            compare(actual, expected),
            Some(CmpOrdering::Less | CmpOrdering::Equal)
        ),
        FilterOperator::In => expected
            .as_array()
            .is_some_and(|values| values.contains(actual)),
        FilterOperator::NotIn => expected
            .as_array()
            .map_or(true, |values| !values.contains(actual)),
        FilterOperator::Like => match (actual.as_str(), expected.as_str()) {
            (Some(text), Some(pattern)) => like(text, pattern),
            _ => false,
        },
        FilterOperator::IsNull => actual.is_null(),
        FilterOperator::IsNotNull => !actual.is_null(),
    }
}

/// SQL `LIKE` with `%` and `_` wildcards.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
