//! Entity store: durable records for permissions, roles, and their edges
//!
//! The [`PermissionStore`] trait is the persistence seam; any durable
//! key-value or relational backend satisfying it will do. [`MemoryStore`] is
//! the in-process reference implementation, serializing mutations behind a
//! single `tokio::sync::RwLock` so check-then-write sequences (uniqueness,
//! cycle guard) are atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{PermissionError, Result};
use crate::hierarchy;
use crate::types::{
    CatalogSnapshot, DirectGrant, Guard, Meta, Permission, PermissionId, Principal, ResourceScope,
    Role, RoleAssignment, RoleGrant, RoleId, TeamId,
};

/// Attributes for a permission to be created
#[derive(Debug, Clone)]
pub struct NewPermission {
    pub name: String,
    pub guard: Guard,
    pub description: Option<String>,
    pub group: Option<String>,
    pub resource: Option<ResourceScope>,
    pub expires_at: Option<DateTime<Utc>>,
    pub team_id: Option<TeamId>,
    pub meta: Meta,
}

impl NewPermission {
    pub fn named(name: impl Into<String>, guard: impl Into<Guard>) -> Self {
        Self {
            name: name.into(),
            guard: guard.into(),
            description: None,
            group: None,
            resource: None,
            expires_at: None,
            team_id: None,
            meta: Meta::new(),
        }
    }

    pub fn for_resource(mut self, resource: ResourceScope) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn expiring(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn in_team(mut self, team_id: TeamId) -> Self {
        self.team_id = Some(team_id);
        self
    }
}

/// Attributes for a role to be created
#[derive(Debug, Clone)]
pub struct NewRole {
    pub name: String,
    pub guard: Guard,
    pub description: Option<String>,
    pub team_id: Option<TeamId>,
    pub meta: Meta,
}

impl NewRole {
    pub fn named(name: impl Into<String>, guard: impl Into<Guard>) -> Self {
        Self {
            name: name.into(),
            guard: guard.into(),
            description: None,
            team_id: None,
            meta: Meta::new(),
        }
    }

    pub fn in_team(mut self, team_id: TeamId) -> Self {
        self.team_id = Some(team_id);
        self
    }
}

/// One edge operation in an atomic batch
#[derive(Debug, Clone)]
pub enum BatchOp {
    GrantToRole {
        permission_id: PermissionId,
        role_id: RoleId,
    },
    RevokeFromRole {
        permission_id: PermissionId,
        role_id: RoleId,
    },
    AssignRole(RoleAssignment),
    RemoveRole {
        role_id: RoleId,
        principal_type: String,
        principal_id: String,
    },
    GrantDirect(DirectGrant),
    RevokeDirect {
        permission_id: PermissionId,
        principal_type: String,
        principal_id: String,
    },
}

/// Per-item outcome of an applied batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub applied: Vec<String>,
}

/// Persistence contract for permissions, roles, and the three edge tables.
///
/// Implementations must serialize mutations per affected entity so
/// check-then-write sequences do not race, and must apply `apply_batch`
/// all-or-nothing.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    // Permissions
    async fn create_permission(&self, new: NewPermission) -> Result<Permission>;
    async fn update_permission(&self, permission: Permission) -> Result<Permission>;
    async fn delete_permission(&self, id: PermissionId) -> Result<()>;
    /// Lookup by `(name, guard, team)`, the store's uniqueness key. A team
    /// lookup falls back to the global (`None`) row when the team holds no
    /// entity of that name.
    async fn find_permission_by_name(
        &self,
        name: &str,
        guard: &Guard,
        team: Option<TeamId>,
    ) -> Result<Permission>;
    async fn find_permission_by_id(&self, id: PermissionId, guard: &Guard) -> Result<Permission>;
    async fn find_or_create_permission(&self, name: &str, guard: &Guard) -> Result<Permission>;

    // Roles
    async fn create_role(&self, new: NewRole) -> Result<Role>;
    async fn update_role(&self, role: Role) -> Result<Role>;
    async fn delete_role(&self, id: RoleId) -> Result<()>;
    async fn find_role_by_name(
        &self,
        name: &str,
        guard: &Guard,
        team: Option<TeamId>,
    ) -> Result<Role>;
    async fn find_role_by_id(&self, id: RoleId, guard: &Guard) -> Result<Role>;
    async fn find_or_create_role(&self, name: &str, guard: &Guard) -> Result<Role>;

    /// Re-point a role's parent edge. Must reject assignments that would
    /// introduce a cycle with `CircularHierarchy`, leaving no partial state.
    async fn set_role_parent(&self, role_id: RoleId, parent_id: Option<RoleId>) -> Result<Role>;

    // Edges
    async fn grant_to_role(&self, permission_id: PermissionId, role_id: RoleId) -> Result<()>;
    async fn revoke_from_role(&self, permission_id: PermissionId, role_id: RoleId) -> Result<()>;
    async fn sync_role_permissions(
        &self,
        role_id: RoleId,
        permission_ids: Vec<PermissionId>,
    ) -> Result<()>;
    async fn assign_role(&self, assignment: RoleAssignment) -> Result<()>;
    async fn remove_role_assignment(&self, role_id: RoleId, principal: &Principal) -> Result<()>;
    async fn grant_direct(&self, grant: DirectGrant) -> Result<()>;
    async fn revoke_direct(&self, permission_id: PermissionId, principal: &Principal)
        -> Result<()>;

    // Queries
    async fn assignments_for(&self, principal: &Principal) -> Result<Vec<RoleAssignment>>;
    async fn direct_grants_for(&self, principal: &Principal) -> Result<Vec<DirectGrant>>;
    async fn list_role_assignments(&self) -> Result<Vec<RoleAssignment>>;

    /// Full catalog, optionally filtered to one team. Entities with no team
    /// are global and included in every partition.
    async fn load_catalog(&self, team: Option<TeamId>) -> Result<CatalogSnapshot>;

    /// Validate every op, then apply all of them atomically. Validation
    /// failure returns `InvalidBulkOperation` enumerating the bad items and
    /// touches no row.
    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<BatchReport>;

    /// Physically delete expired direct grants and expired permissions
    /// (with their edges). Returns the number of rows removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Default)]
struct StoreState {
    next_permission_id: PermissionId,
    next_role_id: RoleId,
    permissions: HashMap<PermissionId, Permission>,
    roles: HashMap<RoleId, Role>,
    role_grants: Vec<RoleGrant>,
    role_assignments: Vec<RoleAssignment>,
    direct_grants: Vec<DirectGrant>,
}

impl StoreState {
    fn permission_by_name(&self, name: &str, guard: &Guard, team: Option<TeamId>) -> Option<&Permission> {
        self.permissions
            .values()
            .find(|p| p.name == name && &p.guard == guard && p.team_id == team)
    }

    fn role_by_name(&self, name: &str, guard: &Guard, team: Option<TeamId>) -> Option<&Role> {
        self.roles
            .values()
            .find(|r| r.name == name && &r.guard == guard && r.team_id == team)
    }

    fn parent_of(&self, role_id: RoleId) -> Option<RoleId> {
        self.roles.get(&role_id).and_then(|r| r.parent_id)
    }

    fn role_depth(&self, role_id: RoleId) -> u32 {
        let mut hops = 0u32;
        let mut current = self.parent_of(role_id);
        while let Some(parent) = current {
            hops += 1;
            if hops as usize > hierarchy::MAX_HOPS {
                break;
            }
            current = self.parent_of(parent);
        }
        hops
    }

    /// Recompute the cached `level` of a role and everything under it
    fn refresh_levels(&mut self, role_id: RoleId) {
        let mut frontier = vec![role_id];
        let mut hops = 0;
        while let Some(current) = frontier.pop() {
            hops += 1;
            if hops > hierarchy::MAX_HOPS {
                break;
            }
            let level = self.role_depth(current);
            if let Some(role) = self.roles.get_mut(&current) {
                role.level = level;
            }
            let children: Vec<RoleId> = self
                .roles
                .values()
                .filter(|r| r.parent_id == Some(current))
                .map(|r| r.id)
                .collect();
            frontier.extend(children);
        }
    }

    fn validate_op(&self, index: usize, op: &BatchOp) -> std::result::Result<(), String> {
        let missing_permission =
            |id: PermissionId| format!("item {index}: permission {id} does not exist");
        let missing_role = |id: RoleId| format!("item {index}: role {id} does not exist");

        match op {
            BatchOp::GrantToRole {
                permission_id,
                role_id,
            }
            | BatchOp::RevokeFromRole {
                permission_id,
                role_id,
            } => {
                if !self.permissions.contains_key(permission_id) {
                    return Err(missing_permission(*permission_id));
                }
                if !self.roles.contains_key(role_id) {
                    return Err(missing_role(*role_id));
                }
            }
            BatchOp::AssignRole(assignment) => {
                if !self.roles.contains_key(&assignment.role_id) {
                    return Err(missing_role(assignment.role_id));
                }
            }
            BatchOp::RemoveRole { role_id, .. } => {
                if !self.roles.contains_key(role_id) {
                    return Err(missing_role(*role_id));
                }
            }
            BatchOp::GrantDirect(grant) => {
                if !self.permissions.contains_key(&grant.permission_id) {
                    return Err(missing_permission(grant.permission_id));
                }
            }
            BatchOp::RevokeDirect { permission_id, .. } => {
                if !self.permissions.contains_key(permission_id) {
                    return Err(missing_permission(*permission_id));
                }
            }
        }
        Ok(())
    }

    fn apply_op(&mut self, op: BatchOp) -> String {
        match op {
            BatchOp::GrantToRole {
                permission_id,
                role_id,
            } => {
                let grant = RoleGrant {
                    permission_id,
                    role_id,
                };
                if !self.role_grants.contains(&grant) {
                    self.role_grants.push(grant);
                }
                format!("granted permission {permission_id} to role {role_id}")
            }
            BatchOp::RevokeFromRole {
                permission_id,
                role_id,
            } => {
                self.role_grants
                    .retain(|g| !(g.permission_id == permission_id && g.role_id == role_id));
                format!("revoked permission {permission_id} from role {role_id}")
            }
            BatchOp::AssignRole(assignment) => {
                let description = format!(
                    "assigned role {} to {}:{}",
                    assignment.role_id, assignment.principal_type, assignment.principal_id
                );
                if !self.role_assignments.contains(&assignment) {
                    self.role_assignments.push(assignment);
                }
                description
            }
            BatchOp::RemoveRole {
                role_id,
                principal_type,
                principal_id,
            } => {
                self.role_assignments.retain(|a| {
                    !(a.role_id == role_id
                        && a.principal_type == principal_type
                        && a.principal_id == principal_id)
                });
                format!("removed role {role_id} from {principal_type}:{principal_id}")
            }
            BatchOp::GrantDirect(grant) => {
                let description = format!(
                    "granted permission {} directly to {}:{}",
                    grant.permission_id, grant.principal_type, grant.principal_id
                );
                self.direct_grants.retain(|g| {
                    !(g.permission_id == grant.permission_id
                        && g.principal_type == grant.principal_type
                        && g.principal_id == grant.principal_id)
                });
                self.direct_grants.push(grant);
                description
            }
            BatchOp::RevokeDirect {
                permission_id,
                principal_type,
                principal_id,
            } => {
                self.direct_grants.retain(|g| {
                    !(g.permission_id == permission_id
                        && g.principal_type == principal_type
                        && g.principal_id == principal_id)
                });
                format!("revoked direct permission {permission_id} from {principal_type}:{principal_id}")
            }
        }
    }
}

/// In-memory store backed by `tokio::sync::RwLock`
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn create_permission(&self, new: NewPermission) -> Result<Permission> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.permission_by_name(&new.name, &new.guard, new.team_id) {
            return Err(PermissionError::DuplicateEntity(format!(
                "permission `{}` (guard `{}`) already exists with id {}",
                existing.name, existing.guard, existing.id
            )));
        }

        state.next_permission_id += 1;
        let permission = Permission {
            id: state.next_permission_id,
            name: new.name,
            guard: new.guard,
            description: new.description,
            group: new.group,
            resource: new.resource,
            expires_at: new.expires_at,
            team_id: new.team_id,
            meta: new.meta,
        };
        state.permissions.insert(permission.id, permission.clone());
        debug!(id = permission.id, name = %permission.name, "permission created");
        Ok(permission)
    }

    async fn update_permission(&self, permission: Permission) -> Result<Permission> {
        let mut state = self.state.write().await;

        if !state.permissions.contains_key(&permission.id) {
            return Err(PermissionError::NotFound(format!(
                "permission {} does not exist",
                permission.id
            )));
        }
        if let Some(other) =
            state.permission_by_name(&permission.name, &permission.guard, permission.team_id)
        {
            if other.id != permission.id {
                return Err(PermissionError::DuplicateEntity(format!(
                    "permission `{}` (guard `{}`) already exists with id {}",
                    other.name, other.guard, other.id
                )));
            }
        }

        state.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    async fn delete_permission(&self, id: PermissionId) -> Result<()> {
        let mut state = self.state.write().await;

        if state.permissions.remove(&id).is_none() {
            return Err(PermissionError::NotFound(format!(
                "permission {id} does not exist"
            )));
        }
        // Cascade to edges
        state.role_grants.retain(|g| g.permission_id != id);
        state.direct_grants.retain(|g| g.permission_id != id);
        debug!(id, "permission deleted");
        Ok(())
    }

    async fn find_permission_by_name(
        &self,
        name: &str,
        guard: &Guard,
        team: Option<TeamId>,
    ) -> Result<Permission> {
        let state = self.state.read().await;
        state
            .permission_by_name(name, guard, team)
            .or_else(|| {
                // Global rows serve every team partition
                team.and_then(|_| state.permission_by_name(name, guard, None))
            })
            .cloned()
            .ok_or_else(|| {
                PermissionError::NotFound(format!(
                    "permission named `{name}` for guard `{guard}`"
                ))
            })
    }

    async fn find_permission_by_id(&self, id: PermissionId, guard: &Guard) -> Result<Permission> {
        let state = self.state.read().await;
        state
            .permissions
            .get(&id)
            .filter(|p| &p.guard == guard)
            .cloned()
            .ok_or_else(|| {
                PermissionError::NotFound(format!("permission {id} for guard `{guard}`"))
            })
    }

    async fn find_or_create_permission(&self, name: &str, guard: &Guard) -> Result<Permission> {
        {
            let state = self.state.read().await;
            if let Some(existing) = state.permission_by_name(name, guard, None) {
                return Ok(existing.clone());
            }
        }
        match self.create_permission(NewPermission::named(name, guard.clone())).await {
            Ok(permission) => Ok(permission),
            // Lost a create race; the row exists now.
            Err(PermissionError::DuplicateEntity(_)) => {
                self.find_permission_by_name(name, guard, None).await
            }
            Err(e) => Err(e),
        }
    }

    async fn create_role(&self, new: NewRole) -> Result<Role> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.role_by_name(&new.name, &new.guard, new.team_id) {
            return Err(PermissionError::DuplicateEntity(format!(
                "role `{}` (guard `{}`) already exists with id {}",
                existing.name, existing.guard, existing.id
            )));
        }

        state.next_role_id += 1;
        let role = Role {
            id: state.next_role_id,
            name: new.name,
            guard: new.guard,
            description: new.description,
            parent_id: None,
            level: 0,
            team_id: new.team_id,
            meta: new.meta,
        };
        state.roles.insert(role.id, role.clone());
        debug!(id = role.id, name = %role.name, "role created");
        Ok(role)
    }

    async fn update_role(&self, role: Role) -> Result<Role> {
        let mut state = self.state.write().await;

        if !state.roles.contains_key(&role.id) {
            return Err(PermissionError::NotFound(format!(
                "role {} does not exist",
                role.id
            )));
        }
        if let Some(other) = state.role_by_name(&role.name, &role.guard, role.team_id) {
            if other.id != role.id {
                return Err(PermissionError::DuplicateEntity(format!(
                    "role `{}` (guard `{}`) already exists with id {}",
                    other.name, other.guard, other.id
                )));
            }
        }

        state.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn delete_role(&self, id: RoleId) -> Result<()> {
        let mut state = self.state.write().await;

        if state.roles.remove(&id).is_none() {
            return Err(PermissionError::NotFound(format!("role {id} does not exist")));
        }
        // Cascade to edges; orphan any children rather than leaving a
        // dangling parent pointer.
        state.role_grants.retain(|g| g.role_id != id);
        state.role_assignments.retain(|a| a.role_id != id);
        let children: Vec<RoleId> = state
            .roles
            .values()
            .filter(|r| r.parent_id == Some(id))
            .map(|r| r.id)
            .collect();
        for child in children {
            if let Some(role) = state.roles.get_mut(&child) {
                role.parent_id = None;
            }
            state.refresh_levels(child);
        }
        debug!(id, "role deleted");
        Ok(())
    }

    async fn find_role_by_name(
        &self,
        name: &str,
        guard: &Guard,
        team: Option<TeamId>,
    ) -> Result<Role> {
        let state = self.state.read().await;
        state
            .role_by_name(name, guard, team)
            .or_else(|| team.and_then(|_| state.role_by_name(name, guard, None)))
            .cloned()
            .ok_or_else(|| {
                PermissionError::NotFound(format!("role named `{name}` for guard `{guard}`"))
            })
    }

    async fn find_role_by_id(&self, id: RoleId, guard: &Guard) -> Result<Role> {
        let state = self.state.read().await;
        state
            .roles
            .get(&id)
            .filter(|r| &r.guard == guard)
            .cloned()
            .ok_or_else(|| PermissionError::NotFound(format!("role {id} for guard `{guard}`")))
    }

    async fn find_or_create_role(&self, name: &str, guard: &Guard) -> Result<Role> {
        {
            let state = self.state.read().await;
            if let Some(existing) = state.role_by_name(name, guard, None) {
                return Ok(existing.clone());
            }
        }
        match self.create_role(NewRole::named(name, guard.clone())).await {
            Ok(role) => Ok(role),
            Err(PermissionError::DuplicateEntity(_)) => {
                self.find_role_by_name(name, guard, None).await
            }
            Err(e) => Err(e),
        }
    }

    async fn set_role_parent(&self, role_id: RoleId, parent_id: Option<RoleId>) -> Result<Role> {
        let mut state = self.state.write().await;

        if !state.roles.contains_key(&role_id) {
            return Err(PermissionError::NotFound(format!(
                "role {role_id} does not exist"
            )));
        }

        if let Some(parent) = parent_id {
            if !state.roles.contains_key(&parent) {
                return Err(PermissionError::NotFound(format!(
                    "role {parent} does not exist"
                )));
            }
            if hierarchy::creates_cycle(role_id, parent, |id| state.parent_of(id)) {
                return Err(PermissionError::CircularHierarchy(format!(
                    "making role {parent} the parent of role {role_id} would close a cycle"
                )));
            }
        }

        if let Some(role) = state.roles.get_mut(&role_id) {
            role.parent_id = parent_id;
        }
        state.refresh_levels(role_id);

        Ok(state.roles[&role_id].clone())
    }

    async fn grant_to_role(&self, permission_id: PermissionId, role_id: RoleId) -> Result<()> {
        let ops = vec![BatchOp::GrantToRole {
            permission_id,
            role_id,
        }];
        self.apply_batch(ops).await.map(|_| ())
    }

    async fn revoke_from_role(&self, permission_id: PermissionId, role_id: RoleId) -> Result<()> {
        let ops = vec![BatchOp::RevokeFromRole {
            permission_id,
            role_id,
        }];
        self.apply_batch(ops).await.map(|_| ())
    }

    async fn sync_role_permissions(
        &self,
        role_id: RoleId,
        permission_ids: Vec<PermissionId>,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        if !state.roles.contains_key(&role_id) {
            return Err(PermissionError::NotFound(format!(
                "role {role_id} does not exist"
            )));
        }
        for permission_id in &permission_ids {
            if !state.permissions.contains_key(permission_id) {
                return Err(PermissionError::NotFound(format!(
                    "permission {permission_id} does not exist"
                )));
            }
        }

        state.role_grants.retain(|g| g.role_id != role_id);
        for permission_id in permission_ids {
            state.role_grants.push(RoleGrant {
                permission_id,
                role_id,
            });
        }
        Ok(())
    }

    async fn assign_role(&self, assignment: RoleAssignment) -> Result<()> {
        let ops = vec![BatchOp::AssignRole(assignment)];
        self.apply_batch(ops).await.map(|_| ())
    }

    async fn remove_role_assignment(&self, role_id: RoleId, principal: &Principal) -> Result<()> {
        let ops = vec![BatchOp::RemoveRole {
            role_id,
            principal_type: principal.principal_type.clone(),
            principal_id: principal.principal_id.clone(),
        }];
        self.apply_batch(ops).await.map(|_| ())
    }

    async fn grant_direct(&self, grant: DirectGrant) -> Result<()> {
        let ops = vec![BatchOp::GrantDirect(grant)];
        self.apply_batch(ops).await.map(|_| ())
    }

    async fn revoke_direct(
        &self,
        permission_id: PermissionId,
        principal: &Principal,
    ) -> Result<()> {
        let ops = vec![BatchOp::RevokeDirect {
            permission_id,
            principal_type: principal.principal_type.clone(),
            principal_id: principal.principal_id.clone(),
        }];
        self.apply_batch(ops).await.map(|_| ())
    }

    async fn assignments_for(&self, principal: &Principal) -> Result<Vec<RoleAssignment>> {
        let state = self.state.read().await;
        Ok(state
            .role_assignments
            .iter()
            .filter(|a| {
                a.principal_type == principal.principal_type
                    && a.principal_id == principal.principal_id
            })
            .cloned()
            .collect())
    }

    async fn direct_grants_for(&self, principal: &Principal) -> Result<Vec<DirectGrant>> {
        let state = self.state.read().await;
        Ok(state
            .direct_grants
            .iter()
            .filter(|g| {
                g.principal_type == principal.principal_type
                    && g.principal_id == principal.principal_id
            })
            .cloned()
            .collect())
    }

    async fn list_role_assignments(&self) -> Result<Vec<RoleAssignment>> {
        let state = self.state.read().await;
        Ok(state.role_assignments.clone())
    }

    async fn load_catalog(&self, team: Option<TeamId>) -> Result<CatalogSnapshot> {
        let state = self.state.read().await;

        let in_team = |entity_team: Option<TeamId>| match team {
            None => true,
            Some(t) => entity_team.is_none() || entity_team == Some(t),
        };

        let permissions: Vec<Permission> = state
            .permissions
            .values()
            .filter(|p| in_team(p.team_id))
            .cloned()
            .collect();
        let roles: Vec<Role> = state
            .roles
            .values()
            .filter(|r| in_team(r.team_id))
            .cloned()
            .collect();
        let role_grants = state
            .role_grants
            .iter()
            .filter(|g| {
                permissions.iter().any(|p| p.id == g.permission_id)
                    && roles.iter().any(|r| r.id == g.role_id)
            })
            .copied()
            .collect();

        Ok(CatalogSnapshot {
            permissions,
            roles,
            role_grants,
        })
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<BatchReport> {
        let mut state = self.state.write().await;

        // Validate everything before touching any row
        let failures: Vec<String> = ops
            .iter()
            .enumerate()
            .filter_map(|(index, op)| state.validate_op(index, op).err())
            .collect();
        if !failures.is_empty() {
            return Err(PermissionError::InvalidBulkOperation(failures.join("; ")));
        }

        let applied = ops.into_iter().map(|op| state.apply_op(op)).collect();
        Ok(BatchReport { applied })
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut removed = 0;

        let before_grants = state.direct_grants.len();
        state.direct_grants.retain(|g| !g.is_expired(now));
        removed += before_grants - state.direct_grants.len();

        let expired_permissions: Vec<PermissionId> = state
            .permissions
            .values()
            .filter(|p| p.is_expired(now))
            .map(|p| p.id)
            .collect();
        for id in expired_permissions {
            state.permissions.remove(&id);
            state.role_grants.retain(|g| g.permission_id != id);
            state.direct_grants.retain(|g| g.permission_id != id);
            removed += 1;
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> Guard {
        Guard::default()
    }

    #[tokio::test]
    async fn test_create_and_find_permission() {
        let store = MemoryStore::new();

        let created = store
            .create_permission(NewPermission::named("edit posts", guard()))
            .await
            .unwrap();
        assert_eq!(created.id, 1);

        let found = store
            .find_permission_by_name("edit posts", &guard(), None)
            .await
            .unwrap();
        assert_eq!(found.id, created.id);

        let miss = store
            .find_permission_by_name("edit posts", &Guard::new("api"), None)
            .await;
        assert!(matches!(miss, Err(PermissionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let store = MemoryStore::new();
        store
            .create_permission(NewPermission::named("edit posts", guard()))
            .await
            .unwrap();

        let duplicate = store
            .create_permission(NewPermission::named("edit posts", guard()))
            .await;
        match duplicate {
            Err(PermissionError::DuplicateEntity(msg)) => assert!(msg.contains("edit posts")),
            other => panic!("expected DuplicateEntity, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_same_name_different_guard_allowed() {
        let store = MemoryStore::new();
        store
            .create_permission(NewPermission::named("edit posts", guard()))
            .await
            .unwrap();
        store
            .create_permission(NewPermission::named("edit posts", Guard::new("api")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_find_or_create_idempotent() {
        let store = MemoryStore::new();

        let first = store
            .find_or_create_permission("view posts", &guard())
            .await
            .unwrap();
        let second = store
            .find_or_create_permission("view posts", &guard())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let catalog = store.load_catalog(None).await.unwrap();
        assert_eq!(catalog.permissions.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_permission_cascades() {
        let store = MemoryStore::new();
        let permission = store
            .create_permission(NewPermission::named("edit posts", guard()))
            .await
            .unwrap();
        let role = store.create_role(NewRole::named("editor", guard())).await.unwrap();
        store.grant_to_role(permission.id, role.id).await.unwrap();

        let principal = Principal::new("user", "1");
        store
            .grant_direct(DirectGrant::new(permission.id, &principal))
            .await
            .unwrap();

        store.delete_permission(permission.id).await.unwrap();

        let catalog = store.load_catalog(None).await.unwrap();
        assert!(catalog.role_grants.is_empty());
        assert!(store.direct_grants_for(&principal).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_parent_rejects_cycle() {
        let store = MemoryStore::new();
        let director = store.create_role(NewRole::named("director", guard())).await.unwrap();
        let manager = store.create_role(NewRole::named("manager", guard())).await.unwrap();

        store.set_role_parent(manager.id, Some(director.id)).await.unwrap();

        let result = store.set_role_parent(director.id, Some(manager.id)).await;
        assert!(matches!(result, Err(PermissionError::CircularHierarchy(_))));

        // Hierarchy unchanged
        let catalog = store.load_catalog(None).await.unwrap();
        assert_eq!(catalog.role_by_id(director.id).unwrap().parent_id, None);
        assert_eq!(
            catalog.role_by_id(manager.id).unwrap().parent_id,
            Some(director.id)
        );
    }

    #[tokio::test]
    async fn test_set_parent_refreshes_levels() {
        let store = MemoryStore::new();
        let root = store.create_role(NewRole::named("root", guard())).await.unwrap();
        let mid = store.create_role(NewRole::named("mid", guard())).await.unwrap();
        let leaf = store.create_role(NewRole::named("leaf", guard())).await.unwrap();

        store.set_role_parent(leaf.id, Some(mid.id)).await.unwrap();
        let mid = store.set_role_parent(mid.id, Some(root.id)).await.unwrap();
        assert_eq!(mid.level, 1);

        let catalog = store.load_catalog(None).await.unwrap();
        assert_eq!(catalog.role_by_id(leaf.id).unwrap().level, 2);
    }

    #[tokio::test]
    async fn test_apply_batch_all_or_nothing() {
        let store = MemoryStore::new();
        let permission = store
            .create_permission(NewPermission::named("edit posts", guard()))
            .await
            .unwrap();
        let role = store.create_role(NewRole::named("editor", guard())).await.unwrap();

        // Second op references a missing permission; nothing may apply
        let result = store
            .apply_batch(vec![
                BatchOp::GrantToRole {
                    permission_id: permission.id,
                    role_id: role.id,
                },
                BatchOp::GrantToRole {
                    permission_id: 999,
                    role_id: role.id,
                },
            ])
            .await;
        assert!(matches!(result, Err(PermissionError::InvalidBulkOperation(_))));

        let catalog = store.load_catalog(None).await.unwrap();
        assert!(catalog.role_grants.is_empty());

        // Valid batch reports per-item outcomes
        let report = store
            .apply_batch(vec![BatchOp::GrantToRole {
                permission_id: permission.id,
                role_id: role.id,
            }])
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_name_lookup_is_team_aware() {
        let store = MemoryStore::new();
        let team_one = store
            .create_permission(NewPermission::named("view reports", guard()).in_team(1))
            .await
            .unwrap();
        let team_two = store
            .create_permission(NewPermission::named("view reports", guard()).in_team(2))
            .await
            .unwrap();

        // Same name in two teams resolves to each team's own row
        let found_one = store
            .find_permission_by_name("view reports", &guard(), Some(1))
            .await
            .unwrap();
        let found_two = store
            .find_permission_by_name("view reports", &guard(), Some(2))
            .await
            .unwrap();
        assert_eq!(found_one.id, team_one.id);
        assert_eq!(found_two.id, team_two.id);

        // No global row of that name exists
        let miss = store.find_permission_by_name("view reports", &guard(), None).await;
        assert!(matches!(miss, Err(PermissionError::NotFound(_))));

        // A team lookup falls back to the global row
        let global = store
            .create_permission(NewPermission::named("sign in", guard()))
            .await
            .unwrap();
        let found = store
            .find_permission_by_name("sign in", &guard(), Some(2))
            .await
            .unwrap();
        assert_eq!(found.id, global.id);
    }

    #[tokio::test]
    async fn test_team_partitioned_catalog() {
        let store = MemoryStore::new();
        store
            .create_permission(NewPermission::named("global", guard()))
            .await
            .unwrap();
        store
            .create_permission(NewPermission::named("team one only", guard()).in_team(1))
            .await
            .unwrap();
        store
            .create_permission(NewPermission::named("team two only", guard()).in_team(2))
            .await
            .unwrap();

        let team_one = store.load_catalog(Some(1)).await.unwrap();
        let names: Vec<&str> = team_one.permissions.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"global"));
        assert!(names.contains(&"team one only"));
        assert!(!names.contains(&"team two only"));
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let permission = store
            .create_permission(
                NewPermission::named("stale", guard()).expiring(now - chrono::Duration::hours(2)),
            )
            .await
            .unwrap();
        store
            .create_permission(NewPermission::named("fresh", guard()))
            .await
            .unwrap();

        let principal = Principal::new("user", "9");
        store
            .grant_direct(DirectGrant::new(permission.id, &principal).expiring(now - chrono::Duration::hours(1)))
            .await
            .unwrap();

        let removed = store.delete_expired(now).await.unwrap();
        assert_eq!(removed, 2);

        let catalog = store.load_catalog(None).await.unwrap();
        assert_eq!(catalog.permissions.len(), 1);
        assert_eq!(catalog.permissions[0].name, "fresh");
    }
}
