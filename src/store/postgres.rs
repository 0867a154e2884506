//! Postgres-backed stores and analytics executor.
//!
//! Reads the application tables (`dashboards`, `dashboard_charts`,
//! `chart_definitions`, `users`, `user_roles`, `roles`, `role_permissions`,
//! `permissions`, `user_organizations`, `organizations`, `token_blacklist`,
//! `chart_data_sources`). Identifier columns are compared as text.

use crate::caches::{
    RbacStore, RoleSummary, RolePermissions, TokenBlacklistStore, UserBasicInfo, UserContext,
};
use crate::config::DatabaseConfig;
use crate::dashboard::{
    ChartDefinition, ChartFilters, DashboardDefinition, DashboardStore, FilterOperator,
    Presentation,
};
use crate::query::{DataQuery, QueryError, QueryExecutor, Row};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::fmt::{self, Debug, Formatter};

/// Upper bound on rows returned for one chart query. One extra row is
/// fetched so a cut-off result can be told apart from an exact fit.
const MAX_QUERY_ROWS: usize = 100_000;

/// Drop rows past [`MAX_QUERY_ROWS`]; true when any were dropped.
fn truncate_rows<T>(rows: &mut Vec<T>) -> bool {
    if rows.len() > MAX_QUERY_ROWS {
        rows.truncate(MAX_QUERY_ROWS);
        true
    } else {
        false
    }
}

#[derive(Debug, FromRow)]
struct DashboardRow {
    dashboard_id: String,
    dashboard_name: String,
    organization_id: Option<String>,
    default_filters: Json<ChartFilters>,
}

#[derive(Debug, FromRow)]
struct ChartRow {
    chart_id: String,
    chart_name: String,
    chart_type: String,
    data_source_id: i64,
    filters: Json<ChartFilters>,
    presentation: Json<Presentation>,
    config: Json<serde_json::Value>,
}

impl From<ChartRow> for ChartDefinition {
    fn from(row: ChartRow) -> Self {
        ChartDefinition {
            chart_id: row.chart_id,
            chart_name: row.chart_name,
            chart_type: row.chart_type,
            data_source_id: row.data_source_id,
            filters: row.filters.0,
            presentation: row.presentation.0,
            config: row.config.0,
        }
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    user_id: String,
    email: String,
    first_name: String,
    last_name: String,
    is_active: bool,
    is_super_admin: bool,
}

#[derive(Debug, FromRow)]
struct OrganizationRow {
    organization_id: String,
    practice_uids: Vec<i64>,
}

#[derive(Debug, FromRow)]
struct DataSourceRow {
    schema_name: String,
    table_name: String,
}

/// One pool serving every Postgres-backed collaborator.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl Debug for PostgresStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PostgresStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_user_row(&self, user_id: &str) -> Result<Option<UserRow>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT user_id::text AS user_id, email, \
             COALESCE(first_name, '') AS first_name, COALESCE(last_name, '') AS last_name, \
             is_active, COALESCE(is_super_admin, false) AS is_super_admin \
             FROM users WHERE user_id::text = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }
}

#[async_trait]
impl DashboardStore for PostgresStore {
    async fn get_dashboard(&self, dashboard_id: &str) -> Result<Option<DashboardDefinition>> {
        let dashboard = sqlx::query_as::<_, DashboardRow>(
            "SELECT dashboard_id::text AS dashboard_id, dashboard_name, \
             organization_id::text AS organization_id, \
             COALESCE(default_filters, '{}'::jsonb) AS default_filters \
             FROM dashboards WHERE dashboard_id::text = $1 AND is_active = true",
        )
        .bind(dashboard_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(dashboard) = dashboard else {
            return Ok(None);
        };

        let charts = sqlx::query_as::<_, ChartRow>(
            "SELECT cd.chart_definition_id::text AS chart_id, cd.chart_name, cd.chart_type, \
             cd.data_source_id::bigint AS data_source_id, \
             COALESCE(cd.filters, '{}'::jsonb) AS filters, \
             COALESCE(cd.presentation, '{}'::jsonb) AS presentation, \
             COALESCE(cd.chart_config, '{}'::jsonb) AS config \
             FROM dashboard_charts dc \
             JOIN chart_definitions cd ON cd.chart_definition_id = dc.chart_definition_id \
             WHERE dc.dashboard_id::text = $1 AND cd.is_active = true \
             ORDER BY dc.display_order, cd.chart_name",
        )
        .bind(dashboard_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(DashboardDefinition {
            dashboard_id: dashboard.dashboard_id,
            dashboard_name: dashboard.dashboard_name,
            organization_id: dashboard.organization_id,
            default_filters: dashboard.default_filters.0,
            charts: charts.into_iter().map(ChartDefinition::from).collect(),
        }))
    }
}

#[async_trait]
impl RbacStore for PostgresStore {
    async fn load_user_context(&self, user_id: &str) -> Result<Option<UserContext>> {
        let Some(user) = self.load_user_row(user_id).await? else {
            return Ok(None);
        };
        if !user.is_active {
            return Ok(None);
        }

        let roles = sqlx::query_as::<_, (String, String)>(
            "SELECT r.role_id::text, r.name FROM user_roles ur \
             JOIN roles r ON r.role_id = ur.role_id \
             WHERE ur.user_id::text = $1 AND r.is_active = true \
             ORDER BY r.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let permissions = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT p.name FROM user_roles ur \
             JOIN role_permissions rp ON rp.role_id = ur.role_id \
             JOIN permissions p ON p.permission_id = rp.permission_id \
             WHERE ur.user_id::text = $1 \
             ORDER BY p.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let organizations = sqlx::query_as::<_, OrganizationRow>(
            "SELECT o.organization_id::text AS organization_id, \
             COALESCE(o.practice_uids, '{}')::bigint[] AS practice_uids \
             FROM user_organizations uo \
             JOIN organizations o ON o.organization_id = uo.organization_id \
             WHERE uo.user_id::text = $1 AND o.is_active = true",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut accessible_practices: Vec<i64> = organizations
            .iter()
            .flat_map(|o| o.practice_uids.iter().copied())
            .collect();
        accessible_practices.sort_unstable();
        accessible_practices.dedup();

        Ok(Some(UserContext {
            user_id: user.user_id,
            email: user.email,
            roles: roles
                .into_iter()
                .map(|(role_id, name)| RoleSummary { role_id, name })
                .collect(),
            permissions,
            organization_ids: organizations.into_iter().map(|o| o.organization_id).collect(),
            accessible_practices,
            is_super_admin: user.is_super_admin,
        }))
    }

    async fn load_role_permissions(&self, role_id: &str) -> Result<Option<RolePermissions>> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM roles WHERE role_id::text = $1)")
                .bind(role_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Ok(None);
        }

        let permissions = sqlx::query_scalar::<_, String>(
            "SELECT p.name FROM role_permissions rp \
             JOIN permissions p ON p.permission_id = rp.permission_id \
             WHERE rp.role_id::text = $1 ORDER BY p.name",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(RolePermissions {
            role_id: role_id.to_string(),
            permissions,
        }))
    }

    async fn load_user_basic(&self, user_id: &str) -> Result<Option<UserBasicInfo>> {
        Ok(self.load_user_row(user_id).await?.map(|user| UserBasicInfo {
            user_id: user.user_id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            is_active: user.is_active,
        }))
    }
}

#[async_trait]
impl TokenBlacklistStore for PostgresStore {
    async fn is_blacklisted(&self, token_id: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM token_blacklist WHERE jti = $1)")
            .bind(token_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn blacklist_token(
        &self,
        token_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_blacklist (jti, user_id, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (jti) DO NOTHING",
        )
        .bind(token_id)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Quote an identifier for interpolation into SQL.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Append `WHERE` predicates for a data query to a `SELECT ... FROM <table> t`.
fn push_predicates(qb: &mut QueryBuilder<'_, Postgres>, query: &DataQuery) {
    qb.push(" WHERE TRUE");
    if let Some(measure) = &query.measure {
        qb.push(" AND t.measure = ").push_bind(measure.clone());
    }
    if let Some(frequency) = &query.frequency {
        qb.push(" AND t.frequency = ").push_bind(frequency.clone());
    }
    if let Some(start) = query.start_date {
        qb.push(" AND t.date_index >= ").push_bind(start);
    }
    if let Some(end) = query.end_date {
        qb.push(" AND t.date_index <= ").push_bind(end);
    }
    if let Some(practices) = query.practice_uids.as_ref().filter(|p| !p.is_empty()) {
        qb.push(" AND t.practice_uid = ANY(")
            .push_bind(practices.clone())
            .push(")");
    }
    if let Some(provider) = &query.provider_name {
        qb.push(" AND t.provider_name = ").push_bind(provider.clone());
    }

    for filter in &query.advanced_filters {
        let field = filter.field.clone();
        let value = Json(filter.value.clone());
        match filter.operator {
            FilterOperator::IsNull | FilterOperator::IsNotNull => {
                qb.push(" AND COALESCE(to_jsonb(t) -> ")
                    .push_bind(field)
                    .push(", 'null'::jsonb)");
                qb.push(if filter.operator == FilterOperator::IsNull {
                    " = 'null'::jsonb"
                } else {
                    " <> 'null'::jsonb"
                });
            }
            FilterOperator::In | FilterOperator::NotIn => {
                qb.push(if filter.operator == FilterOperator::In {
                    " AND "
                } else {
                    " AND NOT "
                });
                qb.push("(")
                    .push_bind(value)
                    .push("::jsonb @> jsonb_build_array(to_jsonb(t) -> ")
                    .push_bind(field)
                    .push("))");
            }
            FilterOperator::Like => {
                qb.push(" AND (to_jsonb(t) ->> ")
                    .push_bind(field)
                    .push(") LIKE ")
                    .push_bind(filter.value.as_str().unwrap_or_default().to_string());
            }
            op => {
                let sql_op = match op {
                    FilterOperator::Eq => "=",
                    FilterOperator::Neq => "<>",
                    FilterOperator::Gt => ">",
                    FilterOperator::Gte => ">=",
                    FilterOperator::Lt => "<",
                    _ => "<=",
                };
                qb.push(" AND (to_jsonb(t) -> ")
                    .push_bind(field)
                    .push(") ")
                    .push(sql_op)
                    .push(" ")
                    .push_bind(value)
                    .push("::jsonb");
            }
        }
    }
}

#[async_trait]
impl QueryExecutor for PostgresStore {
    #[tracing::instrument(
        name = "execute_chart_query",
        skip(self, query),
        fields(
            dashrender.data_source_id = query.data_source_id,
            dashrender.rows_returned = tracing::field::Empty,
            dashrender.rows_truncated = tracing::field::Empty,
        )
    )]
    async fn execute_query(&self, query: &DataQuery) -> Result<Vec<Row>, QueryError> {
        let source = sqlx::query_as::<_, DataSourceRow>(
            "SELECT COALESCE(schema_name, 'public') AS schema_name, table_name \
             FROM chart_data_sources WHERE data_source_id = $1 AND is_active = true",
        )
        .bind(query.data_source_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| QueryError::Invalid(format!("unknown data source {}", query.data_source_id)))?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT to_jsonb(t) FROM ");
        qb.push(quote_ident(&source.schema_name))
            .push(".")
            .push(quote_ident(&source.table_name))
            .push(" t");
        push_predicates(&mut qb, query);

        qb.push(" ORDER BY ");
        if let Some(group_by) = &query.group_by {
            qb.push("(to_jsonb(t) -> ").push_bind(group_by.clone()).push("), ");
        }
        qb.push("t.date_index LIMIT ")
            .push_bind((MAX_QUERY_ROWS + 1) as i64);

        let mut rows: Vec<Json<Row>> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        let truncated = truncate_rows(&mut rows);
        if truncated {
            tracing::warn!(
                data_source_id = query.data_source_id,
                limit = MAX_QUERY_ROWS,
                "chart query result truncated"
            );
        }
        let span = tracing::Span::current();
        span.record("dashrender.rows_returned", rows.len());
        span.record("dashrender.rows_truncated", truncated);
        Ok(rows.into_iter().map(|row| row.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessScope;
    use crate::dashboard::AdvancedFilter;
    use chrono::NaiveDate;
    use serde_json::json;

    fn query() -> DataQuery {
        DataQuery {
            data_source_id: 3,
            measure: Some("Charges".to_string()),
            frequency: None,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            end_date: None,
            practice_uids: Some(vec![1, 2]),
            provider_name: None,
            advanced_filters: vec![
                AdvancedFilter {
                    field: "payer".to_string(),
                    operator: FilterOperator::In,
                    value: json!(["aetna"]),
                },
                AdvancedFilter {
                    field: "amount".to_string(),
                    operator: FilterOperator::Gte,
                    value: json!(10),
                },
            ],
            scope: AccessScope::Practices(vec![1, 2]),
            group_by: None,
        }
    }

    #[test]
    fn test_predicates_are_parameterised() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT to_jsonb(t) FROM x t");
        push_predicates(&mut qb, &query());
        let sql = qb.sql();

        assert_eq!(
            sql,
            "SELECT to_jsonb(t) FROM x t WHERE TRUE AND t.measure = $1 AND t.date_index >= $2 \
             AND t.practice_uid = ANY($3) \
             AND ($4::jsonb @> jsonb_build_array(to_jsonb(t) -> $5)) \
             AND (to_jsonb(t) -> $6) >= $7::jsonb"
        );
        assert!(!sql.contains("aetna"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("charges"), "\"charges\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_rows_past_the_limit_are_dropped() {
        let mut exact = vec![0u8; MAX_QUERY_ROWS];
        assert!(!truncate_rows(&mut exact));
        assert_eq!(exact.len(), MAX_QUERY_ROWS);

        let mut over = vec![0u8; MAX_QUERY_ROWS + 1];
        assert!(truncate_rows(&mut over));
        assert_eq!(over.len(), MAX_QUERY_ROWS);
    }
}
