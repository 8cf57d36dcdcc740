//! Engine facade tying the store, cache, audit trail, and resolver together
//!
//! Every mutation follows the same shape: write to the store, record an
//! audit event (best effort), then invalidate the catalog cache before
//! returning. Checks go the other way: cached catalog plus the principal's
//! own edges, joined in a [`PrincipalView`].

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditSink, MemoryAuditSink, NullAuditSink};
use crate::bulk::{self, ExportDocument, ImportReport};
use crate::cache::{CacheStore, CatalogCache, MemoryCacheStore};
use crate::config::EngineConfig;
use crate::conflicts::{Conflict, ConflictDetector};
use crate::error::{PermissionError, Result};
use crate::resolver::PrincipalView;
use crate::store::{MemoryStore, NewPermission, NewRole, PermissionStore};
use crate::types::{
    DirectGrant, Permission, PermissionRef, Principal, ResourceScope, Role, RoleAssignment,
    RoleRef, TeamId,
};

/// The authorization engine
pub struct PermissionEngine {
    store: Arc<dyn PermissionStore>,
    cache: CatalogCache,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
}

impl PermissionEngine {
    pub fn new(
        store: Arc<dyn PermissionStore>,
        cache_backing: Arc<dyn CacheStore>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        let cache = CatalogCache::new(
            store.clone(),
            cache_backing,
            &config.cache,
            config.teams.enabled,
        );
        Self {
            store,
            cache,
            audit,
            config,
        }
    }

    /// Fully in-memory engine with default configuration
    pub fn in_memory(config: EngineConfig) -> Self {
        let audit: Arc<dyn AuditSink> = if config.audit.enabled {
            Arc::new(MemoryAuditSink::new())
        } else {
            Arc::new(NullAuditSink)
        };
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCacheStore::new()),
            audit,
            config,
        )
    }

    pub fn store(&self) -> &Arc<dyn PermissionStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn audit_event(&self, event: AuditEvent) {
        if !self.config.audit.enabled {
            return;
        }
        if let Err(e) = self.audit.record(event).await {
            // Auditing never fails the mutation that produced the event
            warn!(error = %e, "failed to record audit event");
        }
    }

    /// Resolution for catalog-level administration: names and ids resolve
    /// under the default guard, an already-resolved entity carries its own.
    async fn resolve_permission(&self, reference: PermissionRef) -> Result<Permission> {
        match reference {
            PermissionRef::ByName(name) => {
                self.store
                    .find_permission_by_name(&name, &self.config.default_guard, None)
                    .await
            }
            PermissionRef::ById(id) => {
                self.store
                    .find_permission_by_id(id, &self.config.default_guard)
                    .await
            }
            PermissionRef::Resolved(permission) => Ok(permission),
        }
    }

    async fn resolve_role(&self, reference: RoleRef) -> Result<Role> {
        match reference {
            RoleRef::ByName(name) => {
                self.store
                    .find_role_by_name(&name, &self.config.default_guard, None)
                    .await
            }
            RoleRef::ById(id) => {
                self.store
                    .find_role_by_id(id, &self.config.default_guard)
                    .await
            }
            RoleRef::Resolved(role) => Ok(role),
        }
    }

    /// Resolution on the principal-edge path: names and ids resolve under
    /// the principal's guard and team, and a pre-resolved entity from a
    /// different guard is surfaced as `GuardMismatch` rather than silently
    /// producing a grant no check would honor.
    async fn resolve_permission_for(
        &self,
        reference: PermissionRef,
        principal: &Principal,
    ) -> Result<Permission> {
        match reference {
            PermissionRef::ByName(name) => {
                self.store
                    .find_permission_by_name(&name, &principal.guard, self.partition_for(principal))
                    .await
            }
            PermissionRef::ById(id) => {
                self.store.find_permission_by_id(id, &principal.guard).await
            }
            PermissionRef::Resolved(permission) => {
                if permission.guard != principal.guard {
                    return Err(PermissionError::GuardMismatch {
                        expected: principal.guard.to_string(),
                        found: permission.guard.to_string(),
                    });
                }
                Ok(permission)
            }
        }
    }

    async fn resolve_role_for(&self, reference: RoleRef, principal: &Principal) -> Result<Role> {
        match reference {
            RoleRef::ByName(name) => {
                self.store
                    .find_role_by_name(&name, &principal.guard, self.partition_for(principal))
                    .await
            }
            RoleRef::ById(id) => self.store.find_role_by_id(id, &principal.guard).await,
            RoleRef::Resolved(role) => {
                if role.guard != principal.guard {
                    return Err(PermissionError::GuardMismatch {
                        expected: principal.guard.to_string(),
                        found: role.guard.to_string(),
                    });
                }
                Ok(role)
            }
        }
    }

    // ---- permission catalog ----

    pub async fn create_permission(
        &self,
        new: NewPermission,
        actor: Option<&str>,
    ) -> Result<Permission> {
        let permission = self.store.create_permission(new).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::PermissionCreated)
                .by_actor(actor)
                .with_after(serde_json::to_value(&permission)?),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(permission)
    }

    pub async fn update_permission(
        &self,
        permission: Permission,
        actor: Option<&str>,
    ) -> Result<Permission> {
        let before = self
            .store
            .find_permission_by_id(permission.id, &permission.guard)
            .await?;
        let updated = self.store.update_permission(permission).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::PermissionUpdated)
                .by_actor(actor)
                .with_before(serde_json::to_value(&before)?)
                .with_after(serde_json::to_value(&updated)?),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(updated)
    }

    pub async fn delete_permission(
        &self,
        reference: impl Into<PermissionRef>,
        actor: Option<&str>,
    ) -> Result<()> {
        let permission = self.resolve_permission(reference.into()).await?;
        self.store.delete_permission(permission.id).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::PermissionDeleted)
                .by_actor(actor)
                .with_before(serde_json::to_value(&permission)?),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(())
    }

    pub async fn find_or_create_permission(&self, name: &str) -> Result<Permission> {
        let permission = self
            .store
            .find_or_create_permission(name, &self.config.default_guard)
            .await?;
        self.cache.invalidate().await?;
        Ok(permission)
    }

    // ---- role catalog ----

    pub async fn create_role(&self, new: NewRole, actor: Option<&str>) -> Result<Role> {
        let role = self.store.create_role(new).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::RoleCreated)
                .by_actor(actor)
                .with_after(serde_json::to_value(&role)?),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(role)
    }

    pub async fn update_role(&self, role: Role, actor: Option<&str>) -> Result<Role> {
        let before = self.store.find_role_by_id(role.id, &role.guard).await?;
        let updated = self.store.update_role(role).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::RoleUpdated)
                .by_actor(actor)
                .with_before(serde_json::to_value(&before)?)
                .with_after(serde_json::to_value(&updated)?),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(updated)
    }

    pub async fn delete_role(
        &self,
        reference: impl Into<RoleRef>,
        actor: Option<&str>,
    ) -> Result<()> {
        let role = self.resolve_role(reference.into()).await?;
        self.store.delete_role(role.id).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::RoleDeleted)
                .by_actor(actor)
                .with_before(serde_json::to_value(&role)?),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(())
    }

    pub async fn find_or_create_role(&self, name: &str) -> Result<Role> {
        let role = self
            .store
            .find_or_create_role(name, &self.config.default_guard)
            .await?;
        self.cache.invalidate().await?;
        Ok(role)
    }

    /// Re-point a role's parent, rejecting cycles
    pub async fn set_role_parent(
        &self,
        role: impl Into<RoleRef>,
        parent: Option<RoleRef>,
        actor: Option<&str>,
    ) -> Result<Role> {
        let role = self.resolve_role(role.into()).await?;
        let parent_id = match parent {
            Some(reference) => Some(self.resolve_role(reference).await?.id),
            None => None,
        };

        let updated = self.store.set_role_parent(role.id, parent_id).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::RoleUpdated)
                .by_actor(actor)
                .with_before(serde_json::to_value(&role)?)
                .with_after(serde_json::to_value(&updated)?),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(updated)
    }

    // ---- role <-> permission edges ----

    pub async fn grant_to_role(
        &self,
        permission: impl Into<PermissionRef>,
        role: impl Into<RoleRef>,
        actor: Option<&str>,
    ) -> Result<()> {
        let permission = self.resolve_permission(permission.into()).await?;
        let role = self.resolve_role(role.into()).await?;

        self.store.grant_to_role(permission.id, role.id).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::PermissionGranted)
                .by_actor(actor)
                .with_after(serde_json::json!({
                    "permission": permission.name,
                    "role": role.name,
                })),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(())
    }

    pub async fn revoke_from_role(
        &self,
        permission: impl Into<PermissionRef>,
        role: impl Into<RoleRef>,
        actor: Option<&str>,
    ) -> Result<()> {
        let permission = self.resolve_permission(permission.into()).await?;
        let role = self.resolve_role(role.into()).await?;

        self.store.revoke_from_role(permission.id, role.id).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::PermissionRevoked)
                .by_actor(actor)
                .with_before(serde_json::json!({
                    "permission": permission.name,
                    "role": role.name,
                })),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(())
    }

    /// Replace a role's direct grants with exactly the given permissions
    pub async fn sync_role_permissions(
        &self,
        role: impl Into<RoleRef>,
        permissions: Vec<PermissionRef>,
        actor: Option<&str>,
    ) -> Result<()> {
        let role = self.resolve_role(role.into()).await?;
        let mut permission_ids = Vec::with_capacity(permissions.len());
        for reference in permissions {
            permission_ids.push(self.resolve_permission(reference).await?.id);
        }

        self.store
            .sync_role_permissions(role.id, permission_ids.clone())
            .await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::PermissionGranted)
                .by_actor(actor)
                .with_after(serde_json::json!({
                    "role": role.name,
                    "permission_ids": permission_ids,
                })),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(())
    }

    // ---- principal edges ----

    pub async fn assign_role(
        &self,
        role: impl Into<RoleRef>,
        principal: &Principal,
        actor: Option<&str>,
    ) -> Result<()> {
        let role = self.resolve_role_for(role.into(), principal).await?;

        self.store
            .assign_role(RoleAssignment::new(role.id, principal))
            .await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::RoleAssigned)
                .on_principal(principal)
                .by_actor(actor)
                .with_after(serde_json::json!({ "role": role.name })),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(())
    }

    pub async fn remove_role(
        &self,
        role: impl Into<RoleRef>,
        principal: &Principal,
        actor: Option<&str>,
    ) -> Result<()> {
        let role = self.resolve_role_for(role.into(), principal).await?;

        self.store.remove_role_assignment(role.id, principal).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::RoleRemoved)
                .on_principal(principal)
                .by_actor(actor)
                .with_before(serde_json::json!({ "role": role.name })),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(())
    }

    pub async fn grant_to_principal(
        &self,
        permission: impl Into<PermissionRef>,
        principal: &Principal,
        actor: Option<&str>,
    ) -> Result<()> {
        let permission = self.resolve_permission_for(permission.into(), principal).await?;
        self.apply_direct_grant(DirectGrant::new(permission.id, principal), &permission, principal, actor)
            .await
    }

    /// Direct grant that lapses at the given instant
    pub async fn grant_to_principal_until(
        &self,
        permission: impl Into<PermissionRef>,
        principal: &Principal,
        expires_at: DateTime<Utc>,
        actor: Option<&str>,
    ) -> Result<()> {
        let permission = self.resolve_permission_for(permission.into(), principal).await?;
        let grant = DirectGrant::new(permission.id, principal).expiring(expires_at);
        self.apply_direct_grant(grant, &permission, principal, actor).await
    }

    /// Direct grant scoped to a single resource instance
    pub async fn grant_on_resource(
        &self,
        permission: impl Into<PermissionRef>,
        principal: &Principal,
        resource: ResourceScope,
        actor: Option<&str>,
    ) -> Result<()> {
        let permission = self.resolve_permission_for(permission.into(), principal).await?;
        let grant = DirectGrant::new(permission.id, principal).scoped(resource);
        self.apply_direct_grant(grant, &permission, principal, actor).await
    }

    async fn apply_direct_grant(
        &self,
        grant: DirectGrant,
        permission: &Permission,
        principal: &Principal,
        actor: Option<&str>,
    ) -> Result<()> {
        self.store.grant_direct(grant).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::PermissionGranted)
                .on_principal(principal)
                .by_actor(actor)
                .with_after(serde_json::json!({ "permission": permission.name })),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(())
    }

    pub async fn revoke_from_principal(
        &self,
        permission: impl Into<PermissionRef>,
        principal: &Principal,
        actor: Option<&str>,
    ) -> Result<()> {
        let permission = self.resolve_permission_for(permission.into(), principal).await?;

        self.store.revoke_direct(permission.id, principal).await?;
        self.audit_event(
            AuditEvent::new(AuditEventType::PermissionRevoked)
                .on_principal(principal)
                .by_actor(actor)
                .with_before(serde_json::json!({ "permission": permission.name })),
        )
        .await;
        self.cache.invalidate().await?;
        Ok(())
    }

    // ---- checks ----

    fn partition_for(&self, principal: &Principal) -> Option<TeamId> {
        if self.config.teams.enabled {
            principal.team_id
        } else {
            None
        }
    }

    pub async fn has_permission(
        &self,
        principal: &Principal,
        permission: impl Into<PermissionRef>,
        resource: Option<&ResourceScope>,
    ) -> Result<bool> {
        let catalog = self.cache.get(self.partition_for(principal)).await?;
        let assignments = self.store.assignments_for(principal).await?;
        let direct_grants = self.store.direct_grants_for(principal).await?;

        let view = PrincipalView {
            catalog: &catalog,
            principal,
            assignments: &assignments,
            direct_grants: &direct_grants,
            hierarchical: self.config.hierarchy.enabled,
            now: Utc::now(),
        };
        view.has_permission(permission, resource)
    }

    pub async fn has_any_permission(
        &self,
        principal: &Principal,
        permissions: Vec<PermissionRef>,
    ) -> Result<bool> {
        let catalog = self.cache.get(self.partition_for(principal)).await?;
        let assignments = self.store.assignments_for(principal).await?;
        let direct_grants = self.store.direct_grants_for(principal).await?;

        let view = PrincipalView {
            catalog: &catalog,
            principal,
            assignments: &assignments,
            direct_grants: &direct_grants,
            hierarchical: self.config.hierarchy.enabled,
            now: Utc::now(),
        };
        view.has_any_permission(permissions)
    }

    pub async fn has_all_permissions(
        &self,
        principal: &Principal,
        permissions: Vec<PermissionRef>,
    ) -> Result<bool> {
        let catalog = self.cache.get(self.partition_for(principal)).await?;
        let assignments = self.store.assignments_for(principal).await?;
        let direct_grants = self.store.direct_grants_for(principal).await?;

        let view = PrincipalView {
            catalog: &catalog,
            principal,
            assignments: &assignments,
            direct_grants: &direct_grants,
            hierarchical: self.config.hierarchy.enabled,
            now: Utc::now(),
        };
        view.has_all_permissions(permissions)
    }

    pub async fn has_role(
        &self,
        principal: &Principal,
        role: impl Into<RoleRef>,
    ) -> Result<bool> {
        let catalog = self.cache.get(self.partition_for(principal)).await?;
        let assignments = self.store.assignments_for(principal).await?;

        let view = PrincipalView {
            catalog: &catalog,
            principal,
            assignments: &assignments,
            direct_grants: &[],
            hierarchical: self.config.hierarchy.enabled,
            now: Utc::now(),
        };
        view.has_role(role)
    }

    /// Every live permission the principal holds, directly or through roles
    pub async fn all_permissions(&self, principal: &Principal) -> Result<Vec<Permission>> {
        let catalog = self.cache.get(self.partition_for(principal)).await?;
        let assignments = self.store.assignments_for(principal).await?;
        let direct_grants = self.store.direct_grants_for(principal).await?;

        let view = PrincipalView {
            catalog: &catalog,
            principal,
            assignments: &assignments,
            direct_grants: &direct_grants,
            hierarchical: self.config.hierarchy.enabled,
            now: Utc::now(),
        };
        Ok(view.all_effective_permissions())
    }

    // ---- maintenance ----

    pub async fn detect_conflicts(&self) -> Result<Vec<Conflict>> {
        self.detector().detect().await
    }

    /// Repair auto-fixable conflicts and drop the cache afterwards
    pub async fn auto_fix_conflicts(&self) -> Result<Vec<String>> {
        let applied = self.detector().auto_fix().await?;
        if !applied.is_empty() {
            self.cache.invalidate().await?;
        }
        Ok(applied)
    }

    fn detector(&self) -> ConflictDetector {
        ConflictDetector::new(
            self.store.clone(),
            self.config.conflicts.clone(),
            self.config.hierarchy.clone(),
        )
    }

    /// Physically remove lapsed grants and permissions
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let removed = self.store.delete_expired(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "expired grants cleaned up");
            self.cache.invalidate().await?;
        }
        Ok(removed)
    }

    /// Drop audit entries older than the configured retention window
    pub async fn purge_audit(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.config.audit.retention_days);
        self.audit.purge_older_than(cutoff).await
    }

    // ---- bulk transfer ----

    pub async fn export(&self) -> Result<ExportDocument> {
        bulk::export(self.store.as_ref()).await
    }

    pub async fn import(&self, document: ExportDocument) -> Result<ImportReport> {
        let report = bulk::import(self.store.as_ref(), &self.config.default_guard, document).await?;
        self.cache.invalidate().await?;
        Ok(report)
    }
}
