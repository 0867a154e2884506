//! Redis/Valkey cache backend.

use super::CacheBackend;
use crate::config::CacheConfig;
use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Internal state shared with detached write tasks.
struct RedisState {
    redis: ConnectionManager,
    healthy: AtomicBool,
    /// Milliseconds since `epoch` at which the last probe ran.
    last_probe_ms: AtomicU64,
    epoch: Instant,
    probe_interval: Duration,
    probe_timeout: Duration,
    op_timeout: Duration,
}

impl RedisState {
    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::SeqCst) {
            warn!("cache: redis marked unavailable until next successful probe");
        }
        self.last_probe_ms.store(self.elapsed_ms(), Ordering::SeqCst);
    }
}

/// Cache backend over a Redis-wire-compatible server.
///
/// Every command is bounded by `op_timeout_ms`. A failed command flips the backend
/// to unavailable; `is_available` re-probes with `PING` at most once per
/// `probe_interval_ms`, so a sustained outage costs callers nothing but a flag read.
#[derive(Clone)]
pub struct RedisCacheBackend {
    state: Arc<RedisState>,
}

impl fmt::Debug for RedisCacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCacheBackend")
            .field("redis", &"<ConnectionManager>")
            .field("healthy", &self.state.healthy.load(Ordering::SeqCst))
            .field("op_timeout", &self.state.op_timeout)
            .finish()
    }
}

impl RedisCacheBackend {
    /// Connect to Redis. Fails if the server cannot be reached at startup.
    pub async fn connect(redis_url: &str, config: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let redis = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to redis after {:?}", connect_timeout))??;

        Ok(Self {
            state: Arc::new(RedisState {
                redis,
                healthy: AtomicBool::new(true),
                last_probe_ms: AtomicU64::new(0),
                epoch: Instant::now(),
                probe_interval: Duration::from_millis(config.probe_interval_ms),
                probe_timeout: Duration::from_millis(config.probe_timeout_ms),
                op_timeout: Duration::from_millis(config.op_timeout_ms),
            }),
        })
    }

    async fn probe(&self) -> bool {
        let mut conn = self.state.conn();
        let result = tokio::time::timeout(self.state.probe_timeout, async move {
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            pong
        })
        .await;

        match result {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = %e, fallback = true, "cache: redis probe failed");
                false
            }
            Err(_) => {
                debug!(fallback = true, "cache: redis probe timed out");
                false
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.state.conn();
        let result = tokio::time::timeout(self.state.op_timeout, async move {
            let value: redis::RedisResult<Option<String>> = conn.get(key).await;
            value
        })
        .await;

        match result {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, fallback = true, "cache: redis get failed");
                self.state.mark_unhealthy();
                None
            }
            Err(_) => {
                warn!(key = %key, fallback = true, "cache: redis get timed out");
                self.state.mark_unhealthy();
                None
            }
        }
    }

    fn set(&self, key: &str, value: String, ttl: Duration) {
        if !self.state.healthy.load(Ordering::SeqCst) {
            return;
        }

        let state = Arc::clone(&self.state);
        let key = key.to_string();
        let ttl_secs = ttl.as_secs().max(1);

        tokio::spawn(async move {
            let mut conn = state.conn();
            let result = tokio::time::timeout(state.op_timeout, async {
                let set: redis::RedisResult<()> = conn.set_ex(&key, value, ttl_secs).await;
                set
            })
            .await;

            match result {
                Ok(Ok(())) => debug!(key = %key, ttl_secs, "cache: set"),
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, fallback = true, "cache: redis set failed");
                    state.mark_unhealthy();
                }
                Err(_) => {
                    warn!(key = %key, fallback = true, "cache: redis set timed out");
                    state.mark_unhealthy();
                }
            }
        });
    }

    async fn delete(&self, key: &str) {
        self.delete_many(&[key.to_string()]).await;
    }

    async fn delete_many(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }

        let mut conn = self.state.conn();
        let result = tokio::time::timeout(self.state.op_timeout, async move {
            let deleted: redis::RedisResult<()> = conn.del(keys).await;
            deleted
        })
        .await;

        match result {
            Ok(Ok(())) => debug!(count = keys.len(), "cache: deleted keys"),
            Ok(Err(e)) => {
                warn!(count = keys.len(), error = %e, fallback = true, "cache: redis delete failed");
                self.state.mark_unhealthy();
            }
            Err(_) => {
                warn!(count = keys.len(), fallback = true, "cache: redis delete timed out");
                self.state.mark_unhealthy();
            }
        }
    }

    async fn is_available(&self) -> bool {
        let now = self.state.elapsed_ms();
        let last = self.state.last_probe_ms.load(Ordering::SeqCst);
        let interval_ms = self.state.probe_interval.as_millis() as u64;

        if now.saturating_sub(last) < interval_ms {
            return self.state.healthy.load(Ordering::SeqCst);
        }

        // Only one caller probes per interval; the rest read the current flag.
        if self
            .state
            .last_probe_ms
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return self.state.healthy.load(Ordering::SeqCst);
        }

        let healthy = self.probe().await;
        let was_healthy = self.state.healthy.swap(healthy, Ordering::SeqCst);
        if healthy && !was_healthy {
            tracing::info!("cache: redis available again");
        }
        healthy
    }
}
