//! Audit trail for permission and role mutations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    PermissionGranted,
    PermissionRevoked,
    RoleAssigned,
    RoleRemoved,
    PermissionCreated,
    PermissionUpdated,
    PermissionDeleted,
    RoleCreated,
    RoleUpdated,
    RoleDeleted,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PermissionGranted => "permission_granted",
            Self::PermissionRevoked => "permission_revoked",
            Self::RoleAssigned => "role_assigned",
            Self::RoleRemoved => "role_removed",
            Self::PermissionCreated => "permission_created",
            Self::PermissionUpdated => "permission_updated",
            Self::PermissionDeleted => "permission_deleted",
            Self::RoleCreated => "role_created",
            Self::RoleUpdated => "role_updated",
            Self::RoleDeleted => "role_deleted",
        };
        write!(f, "{name}")
    }
}

/// One recorded mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: AuditEventType,

    /// Principal affected by the change, as "type:id"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,

    /// Who performed the change, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            principal: None,
            actor: None,
            before: None,
            after: None,
            timestamp: Utc::now(),
        }
    }

    pub fn on_principal(mut self, principal: &Principal) -> Self {
        self.principal = Some(principal.key());
        self
    }

    pub fn by_actor(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(str::to_string);
        self
    }

    pub fn with_before(mut self, before: serde_json::Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: serde_json::Value) -> Self {
        self.after = Some(after);
        self
    }
}

/// Destination for audit events. Recording must not fail the mutation that
/// produced the event; callers log and continue on error.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;

    /// Drop events older than the cutoff; returns how many were removed.
    /// Sinks without retention semantics keep the default no-op.
    async fn purge_older_than(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}

const MEMORY_SINK_CAP: usize = 10_000;

/// Bounded in-memory sink, oldest entries dropped first
#[derive(Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent events, newest first
    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        events.iter().rev().take(limit).cloned().collect()
    }

}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        let mut events = self.events.write().await;
        if events.len() >= MEMORY_SINK_CAP {
            let overflow = events.len() + 1 - MEMORY_SINK_CAP;
            events.drain(..overflow);
        }
        events.push(event);
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok(before - events.len())
    }
}

/// Sink that discards everything, used when auditing is disabled
#[derive(Default)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _event: AuditEvent) -> Result<()> {
        Ok(())
    }
}
