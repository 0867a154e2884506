use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Postgres connection string for the application and analytics databases.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

/// Which cache backend fronts the stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Redis,
    Memory,
    #[default]
    Disabled,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,
    /// Redis/Valkey URL, required when `backend = "redis"`.
    pub redis_url: Option<String>,
    /// Prefix prepended to every key (e.g. "prod:"). Empty by default.
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long a liveness probe result is trusted.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Upper bound for a single GET/SET/DEL.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default)]
    pub ttl: TtlConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            redis_url: None,
            key_prefix: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            op_timeout_ms: default_op_timeout_ms(),
            ttl: TtlConfig::default(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    50
}

fn default_op_timeout_ms() -> u64 {
    100
}

/// TTLs, in seconds, for each cache namespace.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TtlConfig {
    pub user_context_secs: u64,
    pub role_permissions_secs: u64,
    pub user_basic_secs: u64,
    pub token_valid_secs: u64,
    pub token_blacklisted_secs: u64,
    /// Date ranges that reach today (or are open-ended).
    pub data_source_current_secs: u64,
    /// Date ranges that ended within the last seven days.
    pub data_source_recent_secs: u64,
    pub data_source_historical_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            user_context_secs: 300,
            role_permissions_secs: 86_400,
            user_basic_secs: 300,
            token_valid_secs: 60,
            token_blacklisted_secs: 3_600,
            data_source_current_secs: 60,
            data_source_recent_secs: 300,
            data_source_historical_secs: 3_600,
        }
    }
}

impl TtlConfig {
    fn all(&self) -> [(&'static str, u64); 8] {
        [
            ("user_context_secs", self.user_context_secs),
            ("role_permissions_secs", self.role_permissions_secs),
            ("user_basic_secs", self.user_basic_secs),
            ("token_valid_secs", self.token_valid_secs),
            ("token_blacklisted_secs", self.token_blacklisted_secs),
            ("data_source_current_secs", self.data_source_current_secs),
            ("data_source_recent_secs", self.data_source_recent_secs),
            ("data_source_historical_secs", self.data_source_historical_secs),
        ]
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderConfig {
    /// Maximum number of chart pipelines polled concurrently within one render.
    ///
    /// Unset means every chart of a dashboard runs at once. A cap makes charts
    /// beyond it wait for a free slot.
    #[serde(default)]
    pub max_parallel_charts: Option<usize>,
    /// Chart types whose display grouping changes the rows fetched.
    #[serde(default)]
    pub fetch_grouping_chart_types: Vec<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_parallel_charts: None,
            fetch_grouping_chart_types: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load(config_path: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::File::with_name(config_path));

        // Add environment variables with prefix DASHRENDER_
        // Example: DASHRENDER_SERVER__PORT=8080, DASHRENDER_CACHE__REDIS_URL=redis://...
        builder = builder.add_source(
            config::Environment::with_prefix("DASHRENDER")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("render.fetch_grouping_chart_types")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            anyhow::bail!("Database 'url' cannot be empty");
        }

        match self.cache.backend {
            CacheBackendKind::Redis => {
                if self.cache.redis_url.is_none() {
                    anyhow::bail!("Redis cache backend requires 'redis_url'");
                }
            }
            CacheBackendKind::Memory | CacheBackendKind::Disabled => {}
        }

        for (name, secs) in self.cache.ttl.all() {
            if secs == 0 {
                anyhow::bail!("Cache TTL '{}' must be greater than zero", name);
            }
        }

        if self.render.max_parallel_charts == Some(0) {
            anyhow::bail!("'max_parallel_charts' must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/analytics".to_string(),
                max_connections: 5,
            },
            cache: CacheConfig::default(),
            render: RenderConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let mut config = base_config();
        config.cache.backend = CacheBackendKind::Redis;
        assert!(config.validate().is_err());

        config.cache.redis_url = Some("redis://127.0.0.1:6379".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = base_config();
        config.cache.ttl.token_valid_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("token_valid_secs"));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut config = base_config();
        config.render.max_parallel_charts = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.toml");
        let config = AppConfig::load(path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cache.backend, CacheBackendKind::Redis);
        assert_eq!(config.cache.ttl.token_blacklisted_secs, 3_600);
        assert_eq!(config.render.max_parallel_charts, None);
    }

    #[test]
    fn test_deserialize_cache_section_with_defaults() {
        let cache: CacheConfig =
            serde_json::from_str(r#"{"backend":"redis","redis_url":"redis://x"}"#).unwrap();
        assert_eq!(cache.backend, CacheBackendKind::Redis);
        assert_eq!(cache.key_prefix, "");
        assert_eq!(cache.ttl.role_permissions_secs, 86_400);
        assert_eq!(cache.probe_timeout_ms, 50);
    }
}
