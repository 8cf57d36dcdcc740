//! Bulk transfer: JSON export and two-pass import of the catalog
//!
//! The document format carries entities by name rather than id so it moves
//! between installations. Import creates permissions first, then roles, then
//! wires parent edges and grants in a second pass so forward references to
//! not-yet-created roles resolve.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PermissionError, Result};
use crate::store::{NewPermission, NewRole, PermissionStore};
use crate::types::{Guard, Meta, ResourceScope};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionExport {
    pub name: String,
    pub guard: Guard,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,

    /// Names of roles holding this permission
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleExport {
    pub name: String,
    pub guard: Guard,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Parent role name, resolved in the second import pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Cached depth, informational; recomputed by the importer
    #[serde(default)]
    pub level: u32,

    /// Permission names granted to this role
    #[serde(default)]
    pub permissions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: u32,
    pub permissions: Vec<PermissionExport>,
    pub roles: Vec<RoleExport>,
}

/// Per-entity outcome of an import run
#[derive(Debug, Default, Clone)]
pub struct ImportReport {
    pub permissions_created: usize,
    pub permissions_existing: usize,
    pub roles_created: usize,
    pub roles_existing: usize,
    pub grants_applied: usize,
}

pub async fn export(store: &dyn PermissionStore) -> Result<ExportDocument> {
    let catalog = store.load_catalog(None).await?;

    let permissions = catalog
        .permissions
        .iter()
        .map(|p| PermissionExport {
            name: p.name.clone(),
            guard: p.guard.clone(),
            description: p.description.clone(),
            group: p.group.clone(),
            resource_type: p.resource.as_ref().map(|r| r.resource_type.clone()),
            resource_id: p.resource.as_ref().map(|r| r.resource_id),
            expires_at: p.expires_at,
            team_id: p.team_id,
            meta: p.meta.clone(),
            roles: catalog
                .roles_with_permission(p.id)
                .filter_map(|id| catalog.role_by_id(id))
                .map(|r| r.name.clone())
                .collect(),
        })
        .collect();

    let roles = catalog
        .roles
        .iter()
        .map(|r| RoleExport {
            name: r.name.clone(),
            guard: r.guard.clone(),
            description: r.description.clone(),
            parent: r
                .parent_id
                .and_then(|id| catalog.role_by_id(id))
                .map(|parent| parent.name.clone()),
            level: r.level,
            permissions: catalog
                .grants_for_role(r.id)
                .filter_map(|id| catalog.permission_by_id(id))
                .map(|p| p.name.clone())
                .collect(),
            team_id: r.team_id,
            meta: r.meta.clone(),
        })
        .collect();

    Ok(ExportDocument {
        version: FORMAT_VERSION,
        permissions,
        roles,
    })
}

// An empty guard in the document inherits the engine's default
fn effective_guard(guard: &Guard, default_guard: &Guard) -> Guard {
    if guard.as_str().is_empty() {
        default_guard.clone()
    } else {
        guard.clone()
    }
}

/// Every name a pass-two edge will look up must already be satisfiable,
/// either by another document entry or by the store. Checked before the
/// first write so a bad document touches nothing.
async fn validate_references(
    store: &dyn PermissionStore,
    default_guard: &Guard,
    document: &ExportDocument,
) -> Result<()> {
    let doc_permissions: HashSet<(String, Guard)> = document
        .permissions
        .iter()
        .map(|p| (p.name.clone(), effective_guard(&p.guard, default_guard)))
        .collect();
    let doc_roles: HashSet<(String, Guard)> = document
        .roles
        .iter()
        .map(|r| (r.name.clone(), effective_guard(&r.guard, default_guard)))
        .collect();

    let mut problems = Vec::new();

    for entry in &document.roles {
        let guard = effective_guard(&entry.guard, default_guard);

        if let Some(parent_name) = &entry.parent {
            let in_doc = doc_roles.contains(&(parent_name.clone(), guard.clone()));
            if !in_doc
                && store
                    .find_role_by_name(parent_name, &guard, entry.team_id)
                    .await
                    .is_err()
            {
                problems.push(format!(
                    "role `{}`: parent role `{parent_name}` does not exist",
                    entry.name
                ));
            }
        }

        for permission_name in &entry.permissions {
            let in_doc = doc_permissions.contains(&(permission_name.clone(), guard.clone()));
            if !in_doc
                && store
                    .find_permission_by_name(permission_name, &guard, entry.team_id)
                    .await
                    .is_err()
            {
                problems.push(format!(
                    "role `{}`: permission `{permission_name}` does not exist",
                    entry.name
                ));
            }
        }
    }

    for entry in &document.permissions {
        let guard = effective_guard(&entry.guard, default_guard);
        for role_name in &entry.roles {
            let in_doc = doc_roles.contains(&(role_name.clone(), guard.clone()));
            if !in_doc
                && store
                    .find_role_by_name(role_name, &guard, entry.team_id)
                    .await
                    .is_err()
            {
                problems.push(format!(
                    "permission `{}`: role `{role_name}` does not exist",
                    entry.name
                ));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PermissionError::InvalidBulkOperation(problems.join("; ")))
    }
}

/// Import a document. Existing entities (same name and guard) are kept as-is;
/// grants and parent edges are applied idempotently. References are fully
/// validated before the first write, so a rejected document leaves the
/// store untouched.
pub async fn import(
    store: &dyn PermissionStore,
    default_guard: &Guard,
    document: ExportDocument,
) -> Result<ImportReport> {
    if document.version != FORMAT_VERSION {
        return Err(PermissionError::InvalidBulkOperation(format!(
            "unsupported document version {} (expected {FORMAT_VERSION})",
            document.version
        )));
    }
    validate_references(store, default_guard, &document).await?;

    let mut report = ImportReport::default();

    // Pass one: permissions, then roles without parent edges
    for entry in &document.permissions {
        let resource = match (&entry.resource_type, entry.resource_id) {
            (Some(resource_type), Some(resource_id)) => {
                Some(ResourceScope::new(resource_type.clone(), resource_id))
            }
            _ => None,
        };
        let new = NewPermission {
            name: entry.name.clone(),
            guard: effective_guard(&entry.guard, default_guard),
            description: entry.description.clone(),
            group: entry.group.clone(),
            resource,
            expires_at: entry.expires_at,
            team_id: entry.team_id,
            meta: entry.meta.clone(),
        };
        match store.create_permission(new).await {
            Ok(_) => report.permissions_created += 1,
            Err(PermissionError::DuplicateEntity(_)) => report.permissions_existing += 1,
            Err(e) => return Err(e),
        }
    }

    for entry in &document.roles {
        let new = NewRole {
            name: entry.name.clone(),
            guard: effective_guard(&entry.guard, default_guard),
            description: entry.description.clone(),
            team_id: entry.team_id,
            meta: entry.meta.clone(),
        };
        match store.create_role(new).await {
            Ok(_) => report.roles_created += 1,
            Err(PermissionError::DuplicateEntity(_)) => report.roles_existing += 1,
            Err(e) => return Err(e),
        }
    }

    // Pass two: parent edges and grants, every referenced name now exists
    for entry in &document.roles {
        let guard = effective_guard(&entry.guard, default_guard);
        let role = store
            .find_role_by_name(&entry.name, &guard, entry.team_id)
            .await?;

        if let Some(parent_name) = &entry.parent {
            let parent = store
                .find_role_by_name(parent_name, &guard, entry.team_id)
                .await?;
            store.set_role_parent(role.id, Some(parent.id)).await?;
        }

        for permission_name in &entry.permissions {
            let permission = store
                .find_permission_by_name(permission_name, &guard, entry.team_id)
                .await?;
            store.grant_to_role(permission.id, role.id).await?;
            report.grants_applied += 1;
        }
    }

    // Permission entries may carry the same edges from the role side; the
    // store deduplicates, only count them once
    for entry in &document.permissions {
        let guard = effective_guard(&entry.guard, default_guard);
        let permission = store
            .find_permission_by_name(&entry.name, &guard, entry.team_id)
            .await?;
        for role_name in &entry.roles {
            let role = store
                .find_role_by_name(role_name, &guard, entry.team_id)
                .await?;
            store.grant_to_role(permission.id, role.id).await?;
        }
    }

    info!(
        permissions = report.permissions_created,
        roles = report.roles_created,
        grants = report.grants_applied,
        "catalog import applied"
    );
    Ok(report)
}
