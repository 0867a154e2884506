//! Distributed cache backend adapter.
//!
//! Every cache access in the crate goes through [`CacheBackend`]. Implementations
//! swallow backend failures at this boundary: a failed `get` is a miss, a failed
//! `set` or `delete` is a no-op. Callers never observe a cache error.

mod memory;
mod redis_backend;

pub use memory::MemoryCacheBackend;
pub use redis_backend::RedisCacheBackend;

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// Key-value cache with TTL, backed by Redis/Valkey or an in-process map.
#[async_trait]
pub trait CacheBackend: Debug + Send + Sync {
    /// Short name used in logs and the health endpoint.
    fn name(&self) -> &'static str;

    /// Fetch a value. Backend errors are logged and reported as a miss.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a value with a TTL without blocking the caller.
    ///
    /// The write is detached from the caller's control flow; its outcome is only logged.
    fn set(&self, key: &str, value: String, ttl: Duration);

    /// Remove a key. Best-effort.
    async fn delete(&self, key: &str);

    /// Remove a known set of keys. Best-effort.
    async fn delete_many(&self, keys: &[String]) {
        for key in keys {
            self.delete(key).await;
        }
    }

    /// Cheap, bounded liveness check. When false, callers skip the cache entirely.
    async fn is_available(&self) -> bool;
}

/// Backend used when caching is disabled: always unavailable, never stores anything.
#[derive(Debug, Default)]
pub struct NoopCacheBackend;

#[async_trait]
impl CacheBackend for NoopCacheBackend {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn set(&self, _key: &str, _value: String, _ttl: Duration) {}

    async fn delete(&self, _key: &str) {}

    async fn is_available(&self) -> bool {
        false
    }
}

/// URL-encode a key segment to avoid `:` conflicts in cache keys.
pub fn encode_key_segment(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}
