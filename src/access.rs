//! Caller access context supplied by the RBAC collaborator.

use crate::dashboard::DashboardDefinition;
use serde::{Deserialize, Serialize};

/// Which rows a caller may see.
///
/// Folded into every query signature so callers with different scopes never share
/// a cached or deduplicated result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "practice_uids", rename_all = "snake_case")]
pub enum AccessScope {
    All,
    Practices(Vec<i64>),
}

/// Identity and data scope of the caller of a render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub user_id: String,
    #[serde(default)]
    pub organization_ids: Vec<String>,
    #[serde(default)]
    pub accessible_practices: Vec<i64>,
    #[serde(default)]
    pub is_super_admin: bool,
}

impl AccessContext {
    pub fn super_admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_ids: Vec::new(),
            accessible_practices: Vec::new(),
            is_super_admin: true,
        }
    }

    pub fn scoped(
        user_id: impl Into<String>,
        organization_ids: Vec<String>,
        accessible_practices: Vec<i64>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_ids,
            accessible_practices,
            is_super_admin: false,
        }
    }

    /// Canonical scope: practice list sorted and deduplicated.
    pub fn scope(&self) -> AccessScope {
        if self.is_super_admin {
            AccessScope::All
        } else {
            let mut practices = self.accessible_practices.clone();
            practices.sort_unstable();
            practices.dedup();
            AccessScope::Practices(practices)
        }
    }

    /// Practices a query may touch, given the practices the filters asked for.
    ///
    /// For a super admin, the requested list is used as-is (empty means unfiltered).
    /// Otherwise the request is intersected with the accessible practices, and an
    /// absent request means every accessible practice.
    pub fn restrict_practices(&self, requested: Option<&[i64]>) -> Vec<i64> {
        let mut practices: Vec<i64> = match (self.is_super_admin, requested) {
            (true, Some(requested)) => requested.to_vec(),
            (true, None) => Vec::new(),
            (false, Some(requested)) => requested
                .iter()
                .copied()
                .filter(|p| self.accessible_practices.contains(p))
                .collect(),
            (false, None) => self.accessible_practices.clone(),
        };
        practices.sort_unstable();
        practices.dedup();
        practices
    }

    /// Whether the caller may render the dashboard at all.
    pub fn can_view_dashboard(&self, dashboard: &DashboardDefinition) -> bool {
        if self.is_super_admin {
            return true;
        }
        match &dashboard.organization_id {
            Some(org) => self.organization_ids.iter().any(|o| o == org),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_is_canonical() {
        let a = AccessContext::scoped("u1", vec![], vec![3, 1, 2, 1]);
        let b = AccessContext::scoped("u2", vec![], vec![1, 2, 3]);
        assert_eq!(a.scope(), b.scope());
        assert_eq!(a.scope(), AccessScope::Practices(vec![1, 2, 3]));
        assert_eq!(AccessContext::super_admin("admin").scope(), AccessScope::All);
    }

    #[test]
    fn test_restrict_practices_intersects_for_scoped_users() {
        let ctx = AccessContext::scoped("u1", vec![], vec![10, 20, 30]);
        assert_eq!(ctx.restrict_practices(None), vec![10, 20, 30]);
        assert_eq!(ctx.restrict_practices(Some(&[30, 40, 10])), vec![10, 30]);
        assert!(ctx.restrict_practices(Some(&[99])).is_empty());
    }

    #[test]
    fn test_restrict_practices_super_admin_passthrough() {
        let ctx = AccessContext::super_admin("admin");
        assert!(ctx.restrict_practices(None).is_empty());
        assert_eq!(ctx.restrict_practices(Some(&[5, 4, 5])), vec![4, 5]);
    }

    #[test]
    fn test_can_view_dashboard_by_organization() {
        let mut dashboard = DashboardDefinition {
            dashboard_id: "d1".to_string(),
            dashboard_name: "Revenue".to_string(),
            organization_id: Some("org-a".to_string()),
            default_filters: Default::default(),
            charts: vec![],
        };
        let member = AccessContext::scoped("u1", vec!["org-a".to_string()], vec![1]);
        let outsider = AccessContext::scoped("u2", vec!["org-b".to_string()], vec![1]);

        assert!(member.can_view_dashboard(&dashboard));
        assert!(!outsider.can_view_dashboard(&dashboard));
        assert!(AccessContext::super_admin("admin").can_view_dashboard(&dashboard));

        dashboard.organization_id = None;
        assert!(outsider.can_view_dashboard(&dashboard));
    }
}
