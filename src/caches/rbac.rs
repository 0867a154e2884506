//! Cached RBAC lookups: user context, role permissions, basic user info.

use super::{CacheNamespace, EntityCache};
use crate::access::AccessContext;
use crate::config::TtlConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSummary {
    pub role_id: String,
    pub name: String,
}

/// A user's roles, permissions and data scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub email: String,
    pub roles: Vec<RoleSummary>,
    pub permissions: Vec<String>,
    pub organization_ids: Vec<String>,
    pub accessible_practices: Vec<i64>,
    pub is_super_admin: bool,
}

impl UserContext {
    pub fn access_context(&self) -> AccessContext {
        AccessContext {
            user_id: self.user_id.clone(),
            organization_ids: self.organization_ids.clone(),
            accessible_practices: self.accessible_practices.clone(),
            is_super_admin: self.is_super_admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermissions {
    pub role_id: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBasicInfo {
    pub user_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
}

/// Source of truth for RBAC entities.
#[async_trait]
pub trait RbacStore: Debug + Send + Sync {
    async fn load_user_context(&self, user_id: &str) -> Result<Option<UserContext>>;
    async fn load_role_permissions(&self, role_id: &str) -> Result<Option<RolePermissions>>;
    async fn load_user_basic(&self, user_id: &str) -> Result<Option<UserBasicInfo>>;
}

/// RBAC lookups fronted by the shared cache.
#[derive(Debug, Clone)]
pub struct RbacCache {
    cache: EntityCache,
    store: Arc<dyn RbacStore>,
    user_context_ttl: Duration,
    role_permissions_ttl: Duration,
    user_basic_ttl: Duration,
}

impl RbacCache {
    pub fn new(cache: EntityCache, store: Arc<dyn RbacStore>, ttl: &TtlConfig) -> Self {
        Self {
            cache,
            store,
            user_context_ttl: Duration::from_secs(ttl.user_context_secs),
            role_permissions_ttl: Duration::from_secs(ttl.role_permissions_secs),
            user_basic_ttl: Duration::from_secs(ttl.user_basic_secs),
        }
    }

    pub async fn get_user_context(&self, user_id: &str) -> Result<Option<UserContext>> {
        let ttl = self.user_context_ttl;
        let (context, _) = self
            .cache
            .get_or_compute(
                CacheNamespace::UserContext,
                user_id,
                |v: &Option<UserContext>| v.as_ref().map(|_| ttl),
                || self.store.load_user_context(user_id),
            )
            .await?;
        Ok(context)
    }

    pub async fn get_role_permissions(&self, role_id: &str) -> Result<Option<RolePermissions>> {
        let ttl = self.role_permissions_ttl;
        let (permissions, _) = self
            .cache
            .get_or_compute(
                CacheNamespace::RolePermissions,
                role_id,
                |v: &Option<RolePermissions>| v.as_ref().map(|_| ttl),
                || self.store.load_role_permissions(role_id),
            )
            .await?;
        Ok(permissions)
    }

    pub async fn get_user_basic(&self, user_id: &str) -> Result<Option<UserBasicInfo>> {
        let ttl = self.user_basic_ttl;
        let (info, _) = self
            .cache
            .get_or_compute(
                CacheNamespace::UserBasic,
                user_id,
                |v: &Option<UserBasicInfo>| v.as_ref().map(|_| ttl),
                || self.store.load_user_basic(user_id),
            )
            .await?;
        Ok(info)
    }

    /// A user's roles, organizations or profile changed.
    pub async fn invalidate_user(&self, user_id: &str) {
        self.cache
            .invalidate(CacheNamespace::UserContext, user_id)
            .await;
        self.cache.invalidate(CacheNamespace::UserBasic, user_id).await;
    }

    /// Bulk variant of [`invalidate_user`](Self::invalidate_user), e.g. for every
    /// member of a role whose permissions changed.
    pub async fn invalidate_users<S: AsRef<str>>(&self, user_ids: &[S]) {
        self.cache
            .invalidate_many(CacheNamespace::UserContext, user_ids)
            .await;
        self.cache
            .invalidate_many(CacheNamespace::UserBasic, user_ids)
            .await;
    }

    /// A role's permission set changed.
    pub async fn invalidate_role(&self, role_id: &str) {
        self.cache
            .invalidate(CacheNamespace::RolePermissions, role_id)
            .await;
    }
}
