//! Cached token blacklist status.

use super::{CacheNamespace, EntityCache};
use crate::config::TtlConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Source of truth for revoked tokens.
#[async_trait]
pub trait TokenBlacklistStore: Debug + Send + Sync {
    async fn is_blacklisted(&self, token_id: &str) -> Result<bool>;

    async fn blacklist_token(
        &self,
        token_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Blacklist checks fronted by the shared cache.
///
/// Not-blacklisted answers are kept briefly so a revocation takes effect quickly
/// on other instances; blacklisted answers are kept long since they never flip back.
#[derive(Debug, Clone)]
pub struct TokenBlacklistCache {
    cache: EntityCache,
    store: Arc<dyn TokenBlacklistStore>,
    valid_ttl: Duration,
    blacklisted_ttl: Duration,
}

impl TokenBlacklistCache {
    pub fn new(cache: EntityCache, store: Arc<dyn TokenBlacklistStore>, ttl: &TtlConfig) -> Self {
        Self {
            cache,
            store,
            valid_ttl: Duration::from_secs(ttl.token_valid_secs),
            blacklisted_ttl: Duration::from_secs(ttl.token_blacklisted_secs),
        }
    }

    pub async fn is_blacklisted(&self, token_id: &str) -> Result<bool> {
        let (valid_ttl, blacklisted_ttl) = (self.valid_ttl, self.blacklisted_ttl);
        let (blacklisted, _) = self
            .cache
            .get_or_compute(
                CacheNamespace::TokenBlacklist,
                token_id,
                |blacklisted: &bool| Some(if *blacklisted { blacklisted_ttl } else { valid_ttl }),
                || self.store.is_blacklisted(token_id),
            )
            .await?;
        Ok(blacklisted)
    }

    /// Revoke a token in the store, then replace any cached answer with the
    /// blacklisted one.
    ///
    /// Writing `true` rather than only deleting keeps a lookup that read the
    /// store before the revocation from caching a stale "not blacklisted".
    pub async fn blacklist(
        &self,
        token_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .blacklist_token(token_id, user_id, expires_at)
            .await?;
        self.cache
            .invalidate(CacheNamespace::TokenBlacklist, token_id)
            .await;
        self.cache.put(
            CacheNamespace::TokenBlacklist,
            token_id,
            &true,
            self.blacklisted_ttl,
        );
        tracing::info!(token_id = %token_id, user_id = %user_id, "token blacklisted");
        Ok(())
    }
}
