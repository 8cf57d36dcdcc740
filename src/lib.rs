//! # rolegate
//!
//! Role and permission management with hierarchical inheritance, guard
//! scoping, catalog caching, and an audit trail.
//!
//! Permissions and roles live in a [`store::PermissionStore`]; checks run
//! against a cached catalog snapshot that every mutation invalidates before
//! returning, so reads that follow a completed write always observe it.
//! Roles may inherit from a parent role, with cycles rejected at write time.
//!
//! ```no_run
//! use rolegate::{EngineConfig, NewPermission, NewRole, PermissionEngine, Principal};
//!
//! # async fn demo() -> rolegate::Result<()> {
//! let engine = PermissionEngine::in_memory(EngineConfig::default());
//! let guard = engine.config().default_guard.clone();
//!
//! engine.create_permission(NewPermission::named("edit posts", guard.clone()), None).await?;
//! engine.create_role(NewRole::named("editor", guard), None).await?;
//! engine.grant_to_role("edit posts", "editor", None).await?;
//!
//! let user = Principal::new("user", "42");
//! engine.assign_role("editor", &user, Some("admin:1")).await?;
//! assert!(engine.has_permission(&user, "edit posts", None).await?);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod bulk;
pub mod cache;
pub mod config;
pub mod conflicts;
pub mod engine;
pub mod error;
pub mod gate;
pub mod hierarchy;
pub mod resolver;
pub mod store;
pub mod types;

pub use audit::{AuditEvent, AuditEventType, AuditSink, MemoryAuditSink};
pub use bulk::{ExportDocument, ImportReport};
pub use cache::{CacheStore, CatalogCache, MemoryCacheStore};
pub use config::EngineConfig;
pub use conflicts::{Conflict, ConflictDetector, ConflictKind, Severity};
pub use engine::PermissionEngine;
pub use error::{PermissionError, Result};
pub use gate::Gate;
pub use resolver::PrincipalView;
pub use store::{BatchOp, BatchReport, MemoryStore, NewPermission, NewRole, PermissionStore};
pub use types::{
    CatalogSnapshot, DirectGrant, Guard, Permission, PermissionId, PermissionRef, Principal,
    ResourceScope, Role, RoleAssignment, RoleGrant, RoleId, RoleRef, TeamId,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
