//! Role hierarchy walking: ancestors, descendants, depth, and inherited
//! permission sets over a catalog snapshot.
//!
//! All walks are bounded by [`MAX_HOPS`] so they terminate even on corrupted
//! data (e.g. a cycle introduced by a bulk import that bypassed the
//! write-time guard). Hitting the cap is reported as a detected cycle, never
//! an infinite loop.

use std::collections::HashSet;

use crate::error::{PermissionError, Result};
use crate::types::{CatalogSnapshot, PermissionId, RoleId};

/// Hard cap on parent/child pointer hops
pub const MAX_HOPS: usize = 100;

/// Walk the ancestor chain of a role, nearest parent first.
///
/// Fails with `CircularHierarchy` if a role id recurs or the hop cap is
/// exceeded before reaching a root.
pub fn ancestors(catalog: &CatalogSnapshot, role_id: RoleId) -> Result<Vec<RoleId>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    seen.insert(role_id);

    let mut current = catalog.role_by_id(role_id).and_then(|r| r.parent_id);

    while let Some(parent_id) = current {
        if !seen.insert(parent_id) || chain.len() >= MAX_HOPS {
            return Err(PermissionError::CircularHierarchy(format!(
                "cycle detected walking ancestors of role {role_id}"
            )));
        }
        chain.push(parent_id);
        current = catalog.role_by_id(parent_id).and_then(|r| r.parent_id);
    }

    Ok(chain)
}

/// Collect every descendant of a role (breadth-first).
pub fn descendants(catalog: &CatalogSnapshot, role_id: RoleId) -> Vec<RoleId> {
    let mut result = Vec::new();
    let mut seen = HashSet::new();
    seen.insert(role_id);

    let mut frontier = vec![role_id];

    while let Some(current) = frontier.pop() {
        if result.len() >= MAX_HOPS {
            break;
        }
        for child in catalog.children_of(current) {
            if seen.insert(child.id) {
                result.push(child.id);
                frontier.push(child.id);
            }
        }
    }

    result
}

/// Hops from a role to its root. Capped at [`MAX_HOPS`].
pub fn depth(catalog: &CatalogSnapshot, role_id: RoleId) -> usize {
    let mut hops = 0;
    let mut current = catalog.role_by_id(role_id).and_then(|r| r.parent_id);
    let mut seen = HashSet::new();
    seen.insert(role_id);

    while let Some(parent_id) = current {
        if !seen.insert(parent_id) || hops >= MAX_HOPS {
            break;
        }
        hops += 1;
        current = catalog.role_by_id(parent_id).and_then(|r| r.parent_id);
    }

    hops
}

/// Effective permission set of a role: its own grants, plus (when
/// `hierarchical` is set) every ancestor's grants, deduplicated by id.
pub fn effective_permissions(
    catalog: &CatalogSnapshot,
    role_id: RoleId,
    hierarchical: bool,
) -> HashSet<PermissionId> {
    let mut permissions: HashSet<PermissionId> = catalog.grants_for_role(role_id).collect();

    if !hierarchical {
        return permissions;
    }

    // Ancestors are bounded; on a detected cycle fall back to the grants
    // collected so far rather than erroring out of a boolean check.
    if let Ok(chain) = ancestors(catalog, role_id) {
        for ancestor_id in chain {
            permissions.extend(catalog.grants_for_role(ancestor_id));
        }
    }

    permissions
}

/// Would pointing `role_id` at `candidate_parent` introduce a cycle?
///
/// Walks the candidate parent's ancestor chain via `parent_of`; the
/// assignment is a cycle iff `role_id` occurs in it (or is the candidate
/// itself).
pub fn creates_cycle<F>(role_id: RoleId, candidate_parent: RoleId, parent_of: F) -> bool
where
    F: Fn(RoleId) -> Option<RoleId>,
{
    if role_id == candidate_parent {
        return true;
    }

    let mut current = Some(candidate_parent);
    let mut hops = 0;

    while let Some(ancestor) = current {
        if ancestor == role_id {
            return true;
        }
        hops += 1;
        if hops > MAX_HOPS {
            // Existing data is already cyclic; refuse the write.
            return true;
        }
        current = parent_of(ancestor);
    }

    false
}
