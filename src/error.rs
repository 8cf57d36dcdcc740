//! Error types for the permission engine

use thiserror::Error;

/// Permission engine errors
#[derive(Debug, Error)]
pub enum PermissionError {
    /// Permission or role lookup miss on a direct lookup
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation on create
    #[error("duplicate entity: {0}")]
    DuplicateEntity(String),

    /// Parent assignment would introduce a cycle
    #[error("circular hierarchy: {0}")]
    CircularHierarchy(String),

    /// Principal and entity belong to different guard namespaces
    #[error("guard mismatch: expected `{expected}`, found `{found}`")]
    GuardMismatch { expected: String, found: String },

    /// Role depth exceeds the configured maximum
    #[error("hierarchy too deep: {0}")]
    HierarchyTooDeep(String),

    /// Batch failed validation before any row was touched
    #[error("invalid bulk operation: {0}")]
    InvalidBulkOperation(String),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(String),

    /// Cache backing store failure
    #[error("cache error: {0}")]
    Cache(String),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for permission operations
pub type Result<T> = std::result::Result<T, PermissionError>;
