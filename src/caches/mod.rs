//! Named entity caches on top of a [`CacheBackend`].
//!
//! Every cache follows the same read path: skip the backend if it is unavailable,
//! otherwise try a get; on a hit return the cached value, on a miss (or an entry
//! that fails to decode) compute from the source of truth and write the result
//! back without waiting for the write. Correctness never depends on the cache.

mod data_source;
mod rbac;
mod token_blacklist;

pub use data_source::{data_source_ttl, DataSourceCache, DataSourceResult};
pub use rbac::{RbacCache, RbacStore, RoleSummary, RolePermissions, UserBasicInfo, UserContext};
pub use token_blacklist::{TokenBlacklistCache, TokenBlacklistStore};

use crate::cache::{encode_key_segment, CacheBackend};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Key namespaces, one per entity cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    UserContext,
    RolePermissions,
    UserBasic,
    TokenBlacklist,
    DataSource,
}

impl CacheNamespace {
    pub const ALL: [CacheNamespace; 5] = [
        CacheNamespace::UserContext,
        CacheNamespace::RolePermissions,
        CacheNamespace::UserBasic,
        CacheNamespace::TokenBlacklist,
        CacheNamespace::DataSource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheNamespace::UserContext => "user_context",
            CacheNamespace::RolePermissions => "role_perms",
            CacheNamespace::UserBasic => "user_basic",
            CacheNamespace::TokenBlacklist => "token_bl",
            CacheNamespace::DataSource => "datasource",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// How a cached read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// The backend was unavailable; the cache was not consulted.
    Bypassed,
}

impl CacheOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheOutcome::Hit)
    }
}

/// Wrapper around cached data with the time it was cached.
#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry<T> {
    data: T,
    cached_at: i64,
}

#[derive(Debug, Default)]
struct NamespaceCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypassed: AtomicU64,
}

/// Point-in-time counters for one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceStats {
    pub hits: u64,
    pub misses: u64,
    pub bypassed: u64,
}

/// Process-wide hit/miss counters, per namespace.
#[derive(Debug, Default)]
pub struct CacheStats {
    counters: [NamespaceCounters; 5],
}

impl CacheStats {
    fn record(&self, namespace: CacheNamespace, outcome: CacheOutcome) {
        let counters = &self.counters[namespace.index()];
        let counter = match outcome {
            CacheOutcome::Hit => &counters.hits,
            CacheOutcome::Miss => &counters.misses,
            CacheOutcome::Bypassed => &counters.bypassed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn namespace(&self, namespace: CacheNamespace) -> NamespaceStats {
        let counters = &self.counters[namespace.index()];
        NamespaceStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            bypassed: counters.bypassed.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, NamespaceStats> {
        CacheNamespace::ALL
            .iter()
            .map(|ns| (ns.as_str(), self.namespace(*ns)))
            .collect()
    }
}

/// Shared core of every entity cache.
#[derive(Debug, Clone)]
pub struct EntityCache {
    backend: Arc<dyn CacheBackend>,
    key_prefix: String,
    stats: Arc<CacheStats>,
}

impl EntityCache {
    pub fn new(backend: Arc<dyn CacheBackend>, key_prefix: impl Into<String>) -> Self {
        Self {
            backend,
            key_prefix: key_prefix.into(),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub async fn is_available(&self) -> bool {
        self.backend.is_available().await
    }

    /// Build the key `{prefix}{namespace}:{entity_id}`.
    pub fn key(&self, namespace: CacheNamespace, entity_id: &str) -> String {
        format!(
            "{}{}:{}",
            self.key_prefix,
            namespace.as_str(),
            encode_key_segment(entity_id)
        )
    }

    /// Read through the cache, computing and writing back on a miss.
    ///
    /// `ttl` decides, from the computed value, how long to keep it; returning
    /// `None` skips the write (used for entities that do not exist).
    pub async fn get_or_compute<T, E, F, Fut, L>(
        &self,
        namespace: CacheNamespace,
        entity_id: &str,
        ttl: L,
        compute: F,
    ) -> Result<(T, CacheOutcome), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        L: FnOnce(&T) -> Option<Duration>,
    {
        let key = self.key(namespace, entity_id);

        if !self.backend.is_available().await {
            debug!(key = %key, fallback = true, "cache: backend unavailable, computing");
            self.stats.record(namespace, CacheOutcome::Bypassed);
            let data = compute().await?;
            return Ok((data, CacheOutcome::Bypassed));
        }

        if let Some(json) = self.backend.get(&key).await {
            match serde_json::from_str::<CachedEntry<T>>(&json) {
                Ok(entry) => {
                    debug!(key = %key, "cache: hit");
                    self.stats.record(namespace, CacheOutcome::Hit);
                    return Ok((entry.data, CacheOutcome::Hit));
                }
                Err(e) => {
                    // Corrupted or outdated entry - treat as miss
                    warn!(key = %key, error = %e, "cache: failed to deserialize entry");
                }
            }
        }

        debug!(key = %key, "cache: miss");
        self.stats.record(namespace, CacheOutcome::Miss);
        let data = compute().await?;

        if let Some(ttl) = ttl(&data) {
            self.write_back(&key, &data, ttl);
        }

        Ok((data, CacheOutcome::Miss))
    }

    /// Overwrite one entity's entry with a value known to be current.
    pub fn put<T: Serialize>(
        &self,
        namespace: CacheNamespace,
        entity_id: &str,
        data: &T,
        ttl: Duration,
    ) {
        let key = self.key(namespace, entity_id);
        debug!(key = %key, "cache: put");
        self.write_back(&key, data, ttl);
    }

    /// Serialize and hand the value to the backend's detached write.
    fn write_back<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) {
        let entry = CachedEntry {
            data,
            cached_at: chrono::Utc::now().timestamp_millis(),
        };
        match serde_json::to_string(&entry) {
            Ok(json) => self.backend.set(key, json, ttl),
            Err(e) => warn!(key = %key, error = %e, "cache: failed to serialize entry"),
        }
    }

    /// Delete one entity's entry.
    pub async fn invalidate(&self, namespace: CacheNamespace, entity_id: &str) {
        let key = self.key(namespace, entity_id);
        debug!(key = %key, "cache: invalidate");
        self.backend.delete(&key).await;
    }

    /// Delete a known set of entries in one round trip.
    pub async fn invalidate_many<S: AsRef<str>>(&self, namespace: CacheNamespace, entity_ids: &[S]) {
        let keys: Vec<String> = entity_ids
            .iter()
            .map(|id| self.key(namespace, id.as_ref()))
            .collect();
        debug!(namespace = namespace.as_str(), count = keys.len(), "cache: bulk invalidate");
        self.backend.delete_many(&keys).await;
    }
}
