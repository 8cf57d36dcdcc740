//! Thin authorization gate over the engine
//!
//! [`Gate`] is the surface application code calls at request time: one
//! principal, one ability name, an optional resource. It adds nothing to
//! resolution semantics, it only fixes the calling convention.

use std::sync::Arc;

use crate::engine::PermissionEngine;
use crate::error::Result;
use crate::types::{PermissionRef, Principal, ResourceScope};

#[derive(Clone)]
pub struct Gate {
    engine: Arc<PermissionEngine>,
}

impl Gate {
    pub fn new(engine: Arc<PermissionEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<PermissionEngine> {
        &self.engine
    }

    /// Whether the principal may perform the ability
    pub async fn allows(&self, principal: &Principal, ability: &str) -> Result<bool> {
        self.engine.has_permission(principal, ability, None).await
    }

    /// Ability check against one resource instance
    pub async fn allows_on(
        &self,
        principal: &Principal,
        ability: &str,
        resource: &ResourceScope,
    ) -> Result<bool> {
        self.engine
            .has_permission(principal, ability, Some(resource))
            .await
    }

    pub async fn denies(&self, principal: &Principal, ability: &str) -> Result<bool> {
        Ok(!self.allows(principal, ability).await?)
    }

    pub async fn any(&self, principal: &Principal, abilities: &[&str]) -> Result<bool> {
        let refs: Vec<PermissionRef> = abilities.iter().map(|a| PermissionRef::from(*a)).collect();
        self.engine.has_any_permission(principal, refs).await
    }

    pub async fn all(&self, principal: &Principal, abilities: &[&str]) -> Result<bool> {
        let refs: Vec<PermissionRef> = abilities.iter().map(|a| PermissionRef::from(*a)).collect();
        self.engine.has_all_permissions(principal, refs).await
    }
}
