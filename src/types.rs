//! Core data model: guards, principals, permissions, roles, and edges

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique permission identifier
pub type PermissionId = i64;

/// Unique role identifier
pub type RoleId = i64;

/// Team (tenant) identifier
pub type TeamId = i64;

/// Guard: namespace partitioning permissions and roles by authentication
/// context (e.g. separate web vs. machine-to-machine principal spaces).
///
/// Carried explicitly on every entity and query, validated once at the API
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guard(String);

impl Guard {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Guard {
    fn default() -> Self {
        Self("web".to_string())
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Guard {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Principal: any entity (user, service account) that can hold roles or
/// permissions. Identity must already be persisted by the caller; there is
/// no deferred assignment on unsaved principals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Principal type discriminator (e.g. "user", "service")
    #[serde(rename = "type")]
    pub principal_type: String,

    /// Identifier within the principal type
    pub principal_id: String,

    /// Guard namespace the principal authenticates under
    #[serde(default)]
    pub guard: Guard,

    /// Team scope, when the teams feature is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
}

impl Principal {
    pub fn new(principal_type: impl Into<String>, principal_id: impl Into<String>) -> Self {
        Self {
            principal_type: principal_type.into(),
            principal_id: principal_id.into(),
            guard: Guard::default(),
            team_id: None,
        }
    }

    pub fn with_guard(mut self, guard: impl Into<Guard>) -> Self {
        self.guard = guard.into();
        self
    }

    pub fn with_team(mut self, team_id: TeamId) -> Self {
        self.team_id = Some(team_id);
        self
    }

    /// "type:id" form used in audit entries
    pub fn key(&self) -> String {
        format!("{}:{}", self.principal_type, self.principal_id)
    }
}

/// Scopes a permission or direct grant to one entity instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceScope {
    pub resource_type: String,
    pub resource_id: i64,
}

impl ResourceScope {
    pub fn new(resource_type: impl Into<String>, resource_id: i64) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id,
        }
    }
}

/// Opaque metadata carried on permissions and roles
pub type Meta = HashMap<String, serde_json::Value>;

/// A named permission. `(name, guard, team_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub name: String,
    pub guard: Guard,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Organizational tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Set iff this is a resource-specific permission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceScope>,

    /// Absolute expiry; `None` never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,

    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

impl Permission {
    /// A permission is resource-specific iff both resource type and id are set
    pub fn is_resource_permission(&self) -> bool {
        self.resource.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// A role. `(name, guard, team_id)` is unique; `parent_id` edges form a
/// forest, enforced at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub guard: Guard,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RoleId>,

    /// Cached depth in the hierarchy, informational only
    #[serde(default)]
    pub level: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,

    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

/// Role↔Permission edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleGrant {
    pub permission_id: PermissionId,
    pub role_id: RoleId,
}

/// Principal↔Role edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role_id: RoleId,
    pub principal_type: String,
    pub principal_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
}

impl RoleAssignment {
    pub fn new(role_id: RoleId, principal: &Principal) -> Self {
        Self {
            role_id,
            principal_type: principal.principal_type.clone(),
            principal_id: principal.principal_id.clone(),
            team_id: principal.team_id,
        }
    }
}

/// Principal↔Permission edge ("direct grant")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectGrant {
    pub permission_id: PermissionId,
    pub principal_type: String,
    pub principal_id: String,

    /// Absolute expiry for this grant specifically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Resource scope override for this grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceScope>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
}

impl DirectGrant {
    pub fn new(permission_id: PermissionId, principal: &Principal) -> Self {
        Self {
            permission_id,
            principal_type: principal.principal_type.clone(),
            principal_id: principal.principal_id.clone(),
            expires_at: None,
            resource: None,
            team_id: principal.team_id,
        }
    }

    pub fn expiring(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn scoped(mut self, resource: ResourceScope) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Reference to a permission: by name, by id, or an already-resolved entity.
/// Replaces duck-typed flexible arguments; resolved once at the API boundary.
#[derive(Debug, Clone)]
pub enum PermissionRef {
    ByName(String),
    ById(PermissionId),
    Resolved(Permission),
}

impl From<&str> for PermissionRef {
    fn from(name: &str) -> Self {
        Self::ByName(name.to_string())
    }
}

impl From<String> for PermissionRef {
    fn from(name: String) -> Self {
        Self::ByName(name)
    }
}

impl From<PermissionId> for PermissionRef {
    fn from(id: PermissionId) -> Self {
        Self::ById(id)
    }
}

impl From<Permission> for PermissionRef {
    fn from(permission: Permission) -> Self {
        Self::Resolved(permission)
    }
}

/// Reference to a role, mirroring [`PermissionRef`]
#[derive(Debug, Clone)]
pub enum RoleRef {
    ByName(String),
    ById(RoleId),
    Resolved(Role),
}

impl From<&str> for RoleRef {
    fn from(name: &str) -> Self {
        Self::ByName(name.to_string())
    }
}

impl From<String> for RoleRef {
    fn from(name: String) -> Self {
        Self::ByName(name)
    }
}

impl From<RoleId> for RoleRef {
    fn from(id: RoleId) -> Self {
        Self::ById(id)
    }
}

impl From<Role> for RoleRef {
    fn from(role: Role) -> Self {
        Self::Resolved(role)
    }
}

/// Read-only snapshot of the full permission/role catalog, as held by the
/// cache layer. Rebuilt from the store, never mutated field-by-field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub permissions: Vec<Permission>,
    pub roles: Vec<Role>,
    pub role_grants: Vec<RoleGrant>,
}

impl CatalogSnapshot {
    pub fn permission_by_id(&self, id: PermissionId) -> Option<&Permission> {
        self.permissions.iter().find(|p| p.id == id)
    }

    pub fn permission_by_name(&self, name: &str, guard: &Guard) -> Option<&Permission> {
        self.permissions
            .iter()
            .find(|p| p.name == name && &p.guard == guard)
    }

    pub fn role_by_id(&self, id: RoleId) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == id)
    }

    pub fn role_by_name(&self, name: &str, guard: &Guard) -> Option<&Role> {
        self.roles
            .iter()
            .find(|r| r.name == name && &r.guard == guard)
    }

    /// Permission ids granted directly to a role (no inheritance)
    pub fn grants_for_role(&self, role_id: RoleId) -> impl Iterator<Item = PermissionId> + '_ {
        self.role_grants
            .iter()
            .filter(move |g| g.role_id == role_id)
            .map(|g| g.permission_id)
    }

    /// Role ids holding a direct grant of a permission
    pub fn roles_with_permission(
        &self,
        permission_id: PermissionId,
    ) -> impl Iterator<Item = RoleId> + '_ {
        self.role_grants
            .iter()
            .filter(move |g| g.permission_id == permission_id)
            .map(|g| g.role_id)
    }

    pub fn children_of(&self, role_id: RoleId) -> impl Iterator<Item = &Role> + '_ {
        self.roles
            .iter()
            .filter(move |r| r.parent_id == Some(role_id))
    }
}
