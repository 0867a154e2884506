//! Single-process cache backend.
//!
//! Used for single-instance deployments and as the substitutable fake in tests.
//! Expiry uses tokio's clock so paused-time tests can advance past TTLs.

use super::CacheBackend;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Expired entries are only dropped on read of the same key, or by the sweep
/// `set` runs at most once per interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// In-memory TTL map with an availability switch.
#[derive(Debug)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, StoredValue>>,
    available: AtomicBool,
    gets: AtomicUsize,
    sets: AtomicUsize,
    deletes: AtomicUsize,
    last_sweep: Mutex<Instant>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Simulate an outage (or recovery) of the backend.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether a live (non-expired) entry exists for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|stored| stored.expires_at > Instant::now())
    }

    /// Remaining TTL of a live entry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.expires_at - now)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    /// Entries held, including expired ones not yet swept.
    pub fn stored_entries(&self) -> usize {
        self.lock().len()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredValue>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            tracing::debug!(key = %key, fallback = true, "cache: memory backend unavailable");
            return None;
        }

        let mut entries = self.lock();
        match entries.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => Some(stored.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: String, ttl: Duration) {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let mut entries = self.lock();
        entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: now + ttl,
            },
        );

        let mut last_sweep = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
        if now.duration_since(*last_sweep) >= SWEEP_INTERVAL {
            let before = entries.len();
            entries.retain(|_, stored| stored.expires_at > now);
            *last_sweep = now;
            tracing::debug!(removed = before - entries.len(), "cache: swept expired entries");
        }
    }

    async fn delete(&self, key: &str) {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return;
        }
        self.lock().remove(key);
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
