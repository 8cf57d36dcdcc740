//! Permission resolution for a single principal
//!
//! [`PrincipalView`] joins one principal's edges (role assignments, direct
//! grants) with a catalog snapshot and answers permission checks against
//! that consistent view. A view is cheap to build and short-lived: the
//! engine constructs one per check from the cached catalog.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::error::{PermissionError, Result};
use crate::hierarchy;
use crate::types::{
    CatalogSnapshot, DirectGrant, Permission, PermissionRef, Principal, ResourceScope,
    RoleAssignment, RoleRef,
};

/// One principal's authorization state at a point in time
pub struct PrincipalView<'a> {
    pub catalog: &'a CatalogSnapshot,
    pub principal: &'a Principal,
    pub assignments: &'a [RoleAssignment],
    pub direct_grants: &'a [DirectGrant],
    /// Whether role-to-parent inheritance contributes permissions
    pub hierarchical: bool,
    pub now: DateTime<Utc>,
}

// Scoped and unscoped grants live in disjoint worlds: an unscoped grant
// never answers a resource-scoped query, and a scoped grant never answers
// an unscoped one.
fn scope_matches(granted: Option<&ResourceScope>, requested: Option<&ResourceScope>) -> bool {
    match (granted, requested) {
        (None, None) => true,
        (Some(have), Some(want)) => have == want,
        _ => false,
    }
}

impl<'a> PrincipalView<'a> {
    /// Resolve a reference against the catalog under the principal's guard.
    /// Name and id misses resolve to `None` (the check fails closed); an
    /// already-resolved permission under the wrong guard is a caller bug and
    /// errors instead.
    fn resolve(&self, reference: &PermissionRef) -> Result<Option<Permission>> {
        match reference {
            PermissionRef::ByName(name) => Ok(self
                .catalog
                .permission_by_name(name, &self.principal.guard)
                .cloned()),
            PermissionRef::ById(id) => Ok(self
                .catalog
                .permission_by_id(*id)
                .filter(|p| p.guard == self.principal.guard)
                .cloned()),
            PermissionRef::Resolved(permission) => {
                if permission.guard != self.principal.guard {
                    return Err(PermissionError::GuardMismatch {
                        expected: self.principal.guard.to_string(),
                        found: permission.guard.to_string(),
                    });
                }
                Ok(Some(permission.clone()))
            }
        }
    }

    pub fn has_direct_permission(
        &self,
        reference: impl Into<PermissionRef>,
        resource: Option<&ResourceScope>,
    ) -> Result<bool> {
        let Some(permission) = self.resolve(&reference.into())? else {
            return Ok(false);
        };
        if permission.is_expired(self.now) {
            return Ok(false);
        }

        Ok(self.direct_grants.iter().any(|grant| {
            grant.permission_id == permission.id
                && !grant.is_expired(self.now)
                && scope_matches(grant.resource.as_ref().or(permission.resource.as_ref()), resource)
        }))
    }

    pub fn has_permission_via_role(
        &self,
        reference: impl Into<PermissionRef>,
        resource: Option<&ResourceScope>,
    ) -> Result<bool> {
        let Some(permission) = self.resolve(&reference.into())? else {
            return Ok(false);
        };
        if permission.is_expired(self.now) {
            return Ok(false);
        }
        if !scope_matches(permission.resource.as_ref(), resource) {
            return Ok(false);
        }

        for assignment in self.assignments {
            let effective = hierarchy::effective_permissions(
                self.catalog,
                assignment.role_id,
                self.hierarchical,
            );
            if effective.contains(&permission.id) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Direct grant or any assigned role (with inheritance when enabled)
    pub fn has_permission(
        &self,
        reference: impl Into<PermissionRef>,
        resource: Option<&ResourceScope>,
    ) -> Result<bool> {
        let reference = reference.into();
        if self.has_direct_permission(reference.clone(), resource)? {
            return Ok(true);
        }
        self.has_permission_via_role(reference, resource)
    }

    pub fn has_any_permission(
        &self,
        references: impl IntoIterator<Item = PermissionRef>,
    ) -> Result<bool> {
        for reference in references {
            if self.has_permission(reference, None)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// All of the given permissions. An empty list is vacuously unsatisfied
    /// and answers `false`.
    pub fn has_all_permissions(
        &self,
        references: impl IntoIterator<Item = PermissionRef>,
    ) -> Result<bool> {
        let mut saw_any = false;
        for reference in references {
            saw_any = true;
            if !self.has_permission(reference, None)? {
                return Ok(false);
            }
        }
        Ok(saw_any)
    }

    pub fn has_role(&self, reference: impl Into<RoleRef>) -> Result<bool> {
        let role_id = match reference.into() {
            RoleRef::ByName(name) => {
                match self.catalog.role_by_name(&name, &self.principal.guard) {
                    Some(role) => role.id,
                    None => return Ok(false),
                }
            }
            RoleRef::ById(id) => id,
            RoleRef::Resolved(role) => {
                if role.guard != self.principal.guard {
                    return Err(PermissionError::GuardMismatch {
                        expected: self.principal.guard.to_string(),
                        found: role.guard.to_string(),
                    });
                }
                role.id
            }
        };
        Ok(self.assignments.iter().any(|a| a.role_id == role_id))
    }

    /// Every live permission the principal holds, directly or through roles,
    /// deduplicated and sorted by name
    pub fn all_effective_permissions(&self) -> Vec<Permission> {
        let mut ids: HashSet<_> = self
            .direct_grants
            .iter()
            .filter(|g| !g.is_expired(self.now))
            .map(|g| g.permission_id)
            .collect();

        for assignment in self.assignments {
            ids.extend(hierarchy::effective_permissions(
                self.catalog,
                assignment.role_id,
                self.hierarchical,
            ));
        }

        let mut permissions: Vec<Permission> = ids
            .into_iter()
            .filter_map(|id| self.catalog.permission_by_id(id))
            .filter(|p| !p.is_expired(self.now) && p.guard == self.principal.guard)
            .cloned()
            .collect();
        permissions.sort_by(|a, b| a.name.cmp(&b.name));
        permissions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Guard, Meta, Role, RoleGrant};

    fn permission(id: i64, name: &str) -> Permission {
        Permission {
            id,
            name: name.to_string(),
            guard: Guard::default(),
            description: None,
            group: None,
            resource: None,
            expires_at: None,
            team_id: None,
            meta: Meta::new(),
        }
    }

    fn role(id: i64, name: &str, parent_id: Option<i64>) -> Role {
        Role {
            id,
            name: name.to_string(),
            guard: Guard::default(),
            description: None,
            parent_id,
            level: 0,
            team_id: None,
            meta: Meta::new(),
        }
    }

    fn catalog() -> CatalogSnapshot {
        CatalogSnapshot {
            permissions: vec![permission(1, "edit posts"), permission(2, "delete posts")],
            roles: vec![role(10, "manager", None), role(11, "editor", Some(10))],
            role_grants: vec![
                RoleGrant {
                    permission_id: 2,
                    role_id: 10,
                },
                RoleGrant {
                    permission_id: 1,
                    role_id: 11,
                },
            ],
        }
    }

    fn view<'a>(
        catalog: &'a CatalogSnapshot,
        principal: &'a Principal,
        assignments: &'a [RoleAssignment],
        direct_grants: &'a [DirectGrant],
    ) -> PrincipalView<'a> {
        PrincipalView {
            catalog,
            principal,
            assignments,
            direct_grants,
            hierarchical: true,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_permission_via_role_with_inheritance() {
        let catalog = catalog();
        let principal = Principal::new("user", "1");
        let assignments = vec![RoleAssignment::new(11, &principal)];

        let v = view(&catalog, &principal, &assignments, &[]);
        assert!(v.has_permission("edit posts", None).unwrap());
        // Inherited from the parent role
        assert!(v.has_permission("delete posts", None).unwrap());
        assert!(!v.has_direct_permission("edit posts", None).unwrap());
    }

    #[test]
    fn test_inheritance_disabled() {
        let catalog = catalog();
        let principal = Principal::new("user", "1");
        let assignments = vec![RoleAssignment::new(11, &principal)];

        let mut v = view(&catalog, &principal, &assignments, &[]);
        v.hierarchical = false;
        assert!(v.has_permission("edit posts", None).unwrap());
        assert!(!v.has_permission("delete posts", None).unwrap());
    }

    #[test]
    fn test_unknown_permission_fails_closed() {
        let catalog = catalog();
        let principal = Principal::new("user", "1");
        let v = view(&catalog, &principal, &[], &[]);
        assert!(!v.has_permission("no such permission", None).unwrap());
        assert!(!v.has_permission(999i64, None).unwrap());
    }

    #[test]
    fn test_guard_mismatch_on_resolved_entity() {
        let catalog = catalog();
        let principal = Principal::new("user", "1").with_guard("api");

        let mut foreign = permission(1, "edit posts");
        foreign.guard = Guard::default();

        let v = view(&catalog, &principal, &[], &[]);
        let result = v.has_permission(foreign, None);
        assert!(matches!(result, Err(PermissionError::GuardMismatch { .. })));
    }

    #[test]
    fn test_direct_grant_and_expiry() {
        let catalog = catalog();
        let principal = Principal::new("user", "42");
        let now = Utc::now();

        let grants = vec![
            DirectGrant::new(1, &principal),
            DirectGrant::new(2, &principal).expiring(now - chrono::Duration::minutes(5)),
        ];
        let v = view(&catalog, &principal, &[], &grants);

        assert!(v.has_direct_permission("edit posts", None).unwrap());
        // Lapsed grant answers false without touching the store
        assert!(!v.has_permission("delete posts", None).unwrap());
    }

    #[test]
    fn test_resource_scoping() {
        let mut catalog = catalog();
        let scope = ResourceScope::new("post", 7);
        catalog.permissions.push(Permission {
            resource: Some(scope.clone()),
            ..permission(3, "edit own post")
        });
        catalog.role_grants.push(RoleGrant {
            permission_id: 3,
            role_id: 11,
        });

        let principal = Principal::new("user", "1");
        let assignments = vec![RoleAssignment::new(11, &principal)];
        let v = view(&catalog, &principal, &assignments, &[]);

        assert!(v.has_permission("edit own post", Some(&scope)).unwrap());
        let other = ResourceScope::new("post", 8);
        assert!(!v.has_permission("edit own post", Some(&other)).unwrap());
        // Scoped grant does not satisfy an unscoped check
        assert!(!v.has_permission("edit own post", None).unwrap());
        // Unscoped grant does not satisfy a scoped check either
        assert!(!v.has_permission("edit posts", Some(&other)).unwrap());
    }

    #[test]
    fn test_has_all_empty_is_false() {
        let catalog = catalog();
        let principal = Principal::new("user", "1");
        let v = view(&catalog, &principal, &[], &[]);
        assert!(!v.has_all_permissions(Vec::new()).unwrap());
        assert!(!v.has_any_permission(Vec::new()).unwrap());
    }

    #[test]
    fn test_has_all_and_any() {
        let catalog = catalog();
        let principal = Principal::new("user", "1");
        let assignments = vec![RoleAssignment::new(11, &principal)];
        let v = view(&catalog, &principal, &assignments, &[]);

        let both: Vec<PermissionRef> = vec!["edit posts".into(), "delete posts".into()];
        assert!(v.has_all_permissions(both).unwrap());

        let mixed: Vec<PermissionRef> = vec!["edit posts".into(), "missing".into()];
        assert!(!v.has_all_permissions(mixed.clone()).unwrap());
        assert!(v.has_any_permission(mixed).unwrap());
    }

    #[test]
    fn test_all_effective_permissions_sorted_and_deduped() {
        let catalog = catalog();
        let principal = Principal::new("user", "1");
        let assignments = vec![RoleAssignment::new(11, &principal)];
        // Direct grant overlapping a role grant
        let grants = vec![DirectGrant::new(1, &principal)];
        let v = view(&catalog, &principal, &assignments, &grants);

        let all = v.all_effective_permissions();
        let names: Vec<&str> = all.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["delete posts", "edit posts"]);
    }

    #[test]
    fn test_has_role() {
        let catalog = catalog();
        let principal = Principal::new("user", "1");
        let assignments = vec![RoleAssignment::new(11, &principal)];
        let v = view(&catalog, &principal, &assignments, &[]);

        assert!(v.has_role("editor").unwrap());
        assert!(!v.has_role("manager").unwrap());
        assert!(!v.has_role("missing").unwrap());
    }
}
