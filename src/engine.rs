use crate::access::AccessContext;
use crate::cache::{CacheBackend, MemoryCacheBackend, NoopCacheBackend, RedisCacheBackend};
use crate::caches::{
    CacheStats, DataSourceCache, EntityCache, RbacCache, RbacStore, TokenBlacklistCache,
    TokenBlacklistStore,
};
use crate::config::{AppConfig, CacheBackendKind, CacheConfig, RenderConfig};
use crate::dashboard::{ChartFilters, DashboardStore};
use crate::query::QueryExecutor;
use crate::render::{
    DashboardRenderResponse, DashboardRenderer, RenderError, RenderRequest, TransformerRegistry,
};
use crate::store::PostgresStore;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Why a caller could not be turned into an access context.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token '{0}' has been revoked")]
    TokenRevoked(String),

    #[error("unknown or inactive user '{0}'")]
    UnknownUser(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Wires caches, stores and the renderer together.
#[derive(Debug)]
pub struct RenderEngine {
    cache: EntityCache,
    rbac: RbacCache,
    tokens: TokenBlacklistCache,
    data_cache: DataSourceCache,
    renderer: DashboardRenderer,
}

impl RenderEngine {
    /// Create a builder for more control over engine configuration.
    pub fn builder() -> RenderEngineBuilder {
        RenderEngineBuilder::new()
    }

    /// Create an engine backed by Postgres, with the cache backend chosen by `config.cache`.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store = Arc::new(PostgresStore::connect(&config.database).await?);
        info!(
            max_connections = config.database.max_connections,
            "Connected to Postgres"
        );

        RenderEngine::builder()
            .dashboard_store(store.clone())
            .rbac_store(store.clone())
            .token_store(store.clone())
            .executor(store)
            .cache_config(config.cache.clone())
            .render_config(config.render.clone())
            .build()
            .await
    }

    pub fn renderer(&self) -> &DashboardRenderer {
        &self.renderer
    }

    pub fn rbac(&self) -> &RbacCache {
        &self.rbac
    }

    pub fn tokens(&self) -> &TokenBlacklistCache {
        &self.tokens
    }

    pub fn data_cache(&self) -> &DataSourceCache {
        &self.data_cache
    }

    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Name of the active cache backend ("redis", "memory" or "disabled").
    pub fn cache_backend_name(&self) -> &'static str {
        self.cache.backend().name()
    }

    pub async fn cache_available(&self) -> bool {
        self.cache.is_available().await
    }

    /// Resolve the caller's access context, rejecting revoked tokens and unknown users.
    #[tracing::instrument(
        name = "authenticate",
        skip(self, token_id),
        fields(dashrender.user_id = %user_id)
    )]
    pub async fn authenticate(
        &self,
        user_id: &str,
        token_id: Option<&str>,
    ) -> Result<AccessContext, AuthError> {
        if let Some(token_id) = token_id {
            if self.tokens.is_blacklisted(token_id).await? {
                return Err(AuthError::TokenRevoked(token_id.to_string()));
            }
        }

        let context = self
            .rbac
            .get_user_context(user_id)
            .await?
            .ok_or_else(|| AuthError::UnknownUser(user_id.to_string()))?;
        Ok(context.access_context())
    }

    /// Render a dashboard for an already-authenticated caller.
    pub async fn render(
        &self,
        dashboard_id: &str,
        universal_filters: ChartFilters,
        access: AccessContext,
    ) -> Result<DashboardRenderResponse, RenderError> {
        self.renderer
            .render(RenderRequest {
                dashboard_id: dashboard_id.to_string(),
                universal_filters,
                access,
            })
            .await
    }
}

/// Builder for [`RenderEngine`]. The four store seams are required; everything
/// else has defaults.
pub struct RenderEngineBuilder {
    cache_backend: Option<Arc<dyn CacheBackend>>,
    cache_config: CacheConfig,
    render_config: RenderConfig,
    dashboard_store: Option<Arc<dyn DashboardStore>>,
    rbac_store: Option<Arc<dyn RbacStore>>,
    token_store: Option<Arc<dyn TokenBlacklistStore>>,
    executor: Option<Arc<dyn QueryExecutor>>,
    transformers: Option<TransformerRegistry>,
}

impl Default for RenderEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderEngineBuilder {
    pub fn new() -> Self {
        Self {
            cache_backend: None,
            cache_config: CacheConfig::default(),
            render_config: RenderConfig::default(),
            dashboard_store: None,
            rbac_store: None,
            token_store: None,
            executor: None,
            transformers: None,
        }
    }

    /// Use this backend instead of building one from the cache configuration.
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    /// Backend selection, key prefix and TTLs.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn render_config(mut self, config: RenderConfig) -> Self {
        self.render_config = config;
        self
    }

    pub fn dashboard_store(mut self, store: Arc<dyn DashboardStore>) -> Self {
        self.dashboard_store = Some(store);
        self
    }

    pub fn rbac_store(mut self, store: Arc<dyn RbacStore>) -> Self {
        self.rbac_store = Some(store);
        self
    }

    pub fn token_store(mut self, store: Arc<dyn TokenBlacklistStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replace the built-in chart transformers.
    pub fn transformers(mut self, registry: TransformerRegistry) -> Self {
        self.transformers = Some(registry);
        self
    }

    /// Build the backend named by the cache configuration. An unreachable Redis
    /// degrades to no caching rather than failing startup.
    async fn resolve_cache_backend(config: &CacheConfig) -> Arc<dyn CacheBackend> {
        match config.backend {
            CacheBackendKind::Disabled => Arc::new(NoopCacheBackend),
            CacheBackendKind::Memory => Arc::new(MemoryCacheBackend::new()),
            CacheBackendKind::Redis => {
                let Some(url) = config.redis_url.as_deref() else {
                    warn!(fallback = true, "Redis cache selected without redis_url, caching disabled");
                    return Arc::new(NoopCacheBackend);
                };
                match RedisCacheBackend::connect(url, config).await {
                    Ok(backend) => Arc::new(backend),
                    Err(e) => {
                        warn!(error = %e, fallback = true, "Redis unreachable at startup, caching disabled");
                        Arc::new(NoopCacheBackend)
                    }
                }
            }
        }
    }

    pub async fn build(self) -> Result<RenderEngine> {
        let dashboard_store = self
            .dashboard_store
            .ok_or_else(|| anyhow!("dashboard store is required"))?;
        let rbac_store = self
            .rbac_store
            .ok_or_else(|| anyhow!("RBAC store is required"))?;
        let token_store = self
            .token_store
            .ok_or_else(|| anyhow!("token blacklist store is required"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow!("query executor is required"))?;

        let backend = match self.cache_backend {
            Some(backend) => backend,
            None => Self::resolve_cache_backend(&self.cache_config).await,
        };
        info!(backend = backend.name(), "Cache backend ready");

        let ttl = &self.cache_config.ttl;
        let cache = EntityCache::new(backend, self.cache_config.key_prefix.clone());
        let rbac = RbacCache::new(cache.clone(), rbac_store, ttl);
        let tokens = TokenBlacklistCache::new(cache.clone(), token_store, ttl);
        let data_cache = DataSourceCache::new(cache.clone(), ttl);

        let renderer = DashboardRenderer::new(
            dashboard_store,
            executor,
            data_cache.clone(),
            self.transformers.unwrap_or_default(),
            &self.render_config,
        );

        Ok(RenderEngine {
            cache,
            rbac,
            tokens,
            data_cache,
            renderer,
        })
    }
}
