//! Engine configuration
//!
//! A single `EngineConfig` struct passed to components at construction time.
//! Sub-structs mirror the feature areas they configure: hierarchy walking,
//! team scoping, catalog caching, audit retention, and conflict detection.

use std::time::Duration;

use crate::types::Guard;

/// Hierarchical roles configuration
#[derive(Debug, Clone)]
pub struct HierarchyConfig {
    /// Whether child roles inherit permissions from their parents
    pub enabled: bool,

    /// Maximum allowed hierarchy depth (advisory, checked by the conflict
    /// detector rather than rejected at write time)
    pub max_depth: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 10,
        }
    }
}

/// Team (multi-tenant) scoping configuration
#[derive(Debug, Clone, Default)]
pub struct TeamConfig {
    /// When enabled, catalog lookups are partitioned by the principal's team
    pub enabled: bool,
}

/// Catalog cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Key prefix for entries in the backing cache store
    pub key_prefix: String,

    /// Time-to-live for the cached catalog snapshot
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rolegate.permission.cache".to_string(),
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Audit trail configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Whether mutations emit audit events
    pub enabled: bool,

    /// Entries older than this many days are eligible for purge
    pub retention_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 365,
        }
    }
}

/// Conflict detector configuration
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Pairs of mutually-exclusive permission name patterns (glob with `*`).
    /// A role holding a match for both sides of a pair is flagged.
    pub exclusive_patterns: Vec<(String, String)>,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            exclusive_patterns: vec![
                ("create *".to_string(), "delete *".to_string()),
                ("read only *".to_string(), "edit *".to_string()),
                ("guest access".to_string(), "admin access".to_string()),
            ],
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Guard assumed when an entity or principal does not carry one
    pub default_guard: Guard,

    pub hierarchy: HierarchyConfig,
    pub teams: TeamConfig,
    pub cache: CacheConfig,
    pub audit: AuditConfig,
    pub conflicts: ConflictConfig,
}
