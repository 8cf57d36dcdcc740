//! Catalog health checks: structural conflicts and their automatic fixes
//!
//! The detector runs scans over a catalog snapshot plus the assignment
//! table. Findings come back as [`Conflict`] values; only orphaned roles and
//! duplicate permissions are safe to repair mechanically, the rest need a
//! human decision.

use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ConflictConfig, HierarchyConfig};
use crate::error::Result;
use crate::hierarchy;
use crate::store::PermissionStore;
use crate::types::{CatalogSnapshot, PermissionId, RoleId, TeamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// Parent chain revisits a role
    CircularHierarchy { role_id: RoleId, path: Vec<RoleId> },

    /// A role holds permissions matching both sides of an exclusive pattern
    /// pair
    ConflictingPermissions {
        role_id: RoleId,
        first: String,
        second: String,
    },

    /// Role with no assigned principals and no child roles
    OrphanedRole { role_id: RoleId },

    /// Permissions whose names normalize to the same signature
    DuplicatePermissions {
        signature: String,
        permission_ids: Vec<PermissionId>,
    },

    /// Role deeper than the configured maximum
    HierarchyTooDeep { role_id: RoleId, depth: usize },
}

impl ConflictKind {
    pub fn severity(&self) -> Severity {
        match self {
            Self::CircularHierarchy { .. } => Severity::High,
            Self::ConflictingPermissions { .. } | Self::HierarchyTooDeep { .. } => {
                Severity::Medium
            }
            Self::OrphanedRole { .. } | Self::DuplicatePermissions { .. } => Severity::Low,
        }
    }

    /// Whether [`ConflictDetector::auto_fix`] can repair this finding
    pub fn auto_fixable(&self) -> bool {
        matches!(
            self,
            Self::OrphanedRole { .. } | Self::DuplicatePermissions { .. }
        )
    }
}

/// One detector finding
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    #[serde(flatten)]
    pub kind: ConflictKind,
    pub severity: Severity,
    pub detail: String,
}

impl Conflict {
    fn new(kind: ConflictKind, detail: String) -> Self {
        Self {
            severity: kind.severity(),
            kind,
            detail,
        }
    }
}

/// `*` matches any run of characters; everything else is literal,
/// case-insensitive
fn pattern_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("(?i)^{escaped}$")).ok()
}

/// Lowercase, keep letters and spaces only, sort the words. "View Posts"
/// and "view  posts" share a signature.
fn name_signature(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphabetic() || c == ' ' { c } else { ' ' })
        .collect();
    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    words.sort_unstable();
    words.join(" ")
}

pub struct ConflictDetector {
    store: Arc<dyn PermissionStore>,
    conflicts: ConflictConfig,
    hierarchy: HierarchyConfig,
}

impl ConflictDetector {
    pub fn new(
        store: Arc<dyn PermissionStore>,
        conflicts: ConflictConfig,
        hierarchy: HierarchyConfig,
    ) -> Self {
        Self {
            store,
            conflicts,
            hierarchy,
        }
    }

    /// Run every scan over the current catalog
    pub async fn detect(&self) -> Result<Vec<Conflict>> {
        let catalog = self.store.load_catalog(None).await?;
        let assignments = self.store.list_role_assignments().await?;

        let mut findings = Vec::new();
        self.scan_cycles(&catalog, &mut findings);
        self.scan_exclusive_patterns(&catalog, &mut findings);
        self.scan_orphans(&catalog, &assignments, &mut findings);
        self.scan_duplicates(&catalog, &mut findings);
        self.scan_depth(&catalog, &mut findings);

        if !findings.is_empty() {
            warn!(count = findings.len(), "catalog conflicts detected");
        }
        Ok(findings)
    }

    fn scan_cycles(&self, catalog: &CatalogSnapshot, findings: &mut Vec<Conflict>) {
        let mut flagged: HashSet<RoleId> = HashSet::new();

        for role in &catalog.roles {
            if flagged.contains(&role.id) {
                continue;
            }
            let mut path = vec![role.id];
            let mut seen: HashSet<RoleId> = path.iter().copied().collect();
            let mut current = role.parent_id;
            let mut hops = 0;

            while let Some(parent) = current {
                hops += 1;
                if hops > hierarchy::MAX_HOPS {
                    break;
                }
                if !seen.insert(parent) {
                    path.push(parent);
                    // Every role on the loop is covered by this finding. The
                    // repeated id is a loop member; the walk may have started
                    // upstream of the loop itself.
                    flagged.extend(path.iter().copied());
                    findings.push(Conflict::new(
                        ConflictKind::CircularHierarchy {
                            role_id: parent,
                            path: path.clone(),
                        },
                        format!(
                            "role {parent} participates in a circular parent chain {path:?}"
                        ),
                    ));
                    break;
                }
                path.push(parent);
                current = catalog.role_by_id(parent).and_then(|r| r.parent_id);
            }
        }
    }

    fn scan_exclusive_patterns(&self, catalog: &CatalogSnapshot, findings: &mut Vec<Conflict>) {
        let compiled: Vec<(Regex, Regex, &str, &str)> = self
            .conflicts
            .exclusive_patterns
            .iter()
            .filter_map(|(first, second)| {
                Some((
                    pattern_to_regex(first)?,
                    pattern_to_regex(second)?,
                    first.as_str(),
                    second.as_str(),
                ))
            })
            .collect();

        for role in &catalog.roles {
            let names: Vec<&str> = hierarchy::effective_permissions(
                catalog,
                role.id,
                self.hierarchy.enabled,
            )
            .into_iter()
            .filter_map(|id| catalog.permission_by_id(id))
            .map(|p| p.name.as_str())
            .collect();

            for (first_re, second_re, first, second) in &compiled {
                let hits_first = names.iter().any(|n| first_re.is_match(n));
                let hits_second = names.iter().any(|n| second_re.is_match(n));
                if hits_first && hits_second {
                    findings.push(Conflict::new(
                        ConflictKind::ConflictingPermissions {
                            role_id: role.id,
                            first: (*first).to_string(),
                            second: (*second).to_string(),
                        },
                        format!(
                            "role `{}` holds permissions matching both `{first}` and `{second}`",
                            role.name
                        ),
                    ));
                }
            }
        }
    }

    fn scan_orphans(
        &self,
        catalog: &CatalogSnapshot,
        assignments: &[crate::types::RoleAssignment],
        findings: &mut Vec<Conflict>,
    ) {
        let assigned: HashSet<RoleId> = assignments.iter().map(|a| a.role_id).collect();
        let parents: HashSet<RoleId> =
            catalog.roles.iter().filter_map(|r| r.parent_id).collect();

        for role in &catalog.roles {
            if !assigned.contains(&role.id) && !parents.contains(&role.id) {
                findings.push(Conflict::new(
                    ConflictKind::OrphanedRole { role_id: role.id },
                    format!(
                        "role `{}` has no assigned principals and no child roles",
                        role.name
                    ),
                ));
            }
        }
    }

    fn scan_duplicates(&self, catalog: &CatalogSnapshot, findings: &mut Vec<Conflict>) {
        // Guard and team both partition the namespace; a shared signature
        // only counts as a duplicate within one partition
        let mut groups: HashMap<(String, String, Option<TeamId>), Vec<PermissionId>> =
            HashMap::new();
        for permission in &catalog.permissions {
            groups
                .entry((
                    name_signature(&permission.name),
                    permission.guard.to_string(),
                    permission.team_id,
                ))
                .or_default()
                .push(permission.id);
        }

        for ((signature, _guard, _team), mut permission_ids) in groups {
            if permission_ids.len() > 1 {
                permission_ids.sort_unstable();
                findings.push(Conflict::new(
                    ConflictKind::DuplicatePermissions {
                        signature: signature.clone(),
                        permission_ids: permission_ids.clone(),
                    },
                    format!(
                        "permissions {permission_ids:?} normalize to the same name `{signature}`"
                    ),
                ));
            }
        }
    }

    fn scan_depth(&self, catalog: &CatalogSnapshot, findings: &mut Vec<Conflict>) {
        for role in &catalog.roles {
            let depth = hierarchy::depth(catalog, role.id);
            if depth > self.hierarchy.max_depth {
                findings.push(Conflict::new(
                    ConflictKind::HierarchyTooDeep {
                        role_id: role.id,
                        depth,
                    },
                    format!(
                        "role `{}` sits {depth} levels deep (maximum {})",
                        role.name, self.hierarchy.max_depth
                    ),
                ));
            }
        }
    }

    /// Repair the auto-fixable findings: delete orphaned roles, merge
    /// duplicate permission groups into their lowest-id member. Returns one
    /// message per applied fix.
    pub async fn auto_fix(&self) -> Result<Vec<String>> {
        let findings = self.detect().await?;
        let mut applied = Vec::new();

        for finding in findings.iter().filter(|f| f.kind.auto_fixable()) {
            match &finding.kind {
                ConflictKind::OrphanedRole { role_id } => {
                    self.store.delete_role(*role_id).await?;
                    applied.push(format!("deleted orphaned role {role_id}"));
                }
                ConflictKind::DuplicatePermissions { permission_ids, .. } => {
                    let Some((&keeper, rest)) = permission_ids.split_first() else {
                        continue;
                    };
                    let catalog = self.store.load_catalog(None).await?;
                    for &duplicate in rest {
                        let holders: Vec<RoleId> =
                            catalog.roles_with_permission(duplicate).collect();
                        for role_id in holders {
                            self.store.grant_to_role(keeper, role_id).await?;
                        }
                        self.store.delete_permission(duplicate).await?;
                    }
                    applied.push(format!(
                        "merged duplicate permissions {rest:?} into {keeper}"
                    ));
                }
                _ => {}
            }
        }

        if !applied.is_empty() {
            info!(fixes = applied.len(), "auto-fix applied");
        }
        Ok(applied)
    }
}
