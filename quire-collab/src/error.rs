//! Error taxonomy for the collaboration core.
//!
//! `CollabError` is what a caller sees synchronously. Workflow failures
//! (`WorkflowActionError`, `ExternalServiceError`) never travel back to the
//! triggering request; the engine logs them and records them in the audit log.

use thiserror::Error;
use uuid::Uuid;

use crate::model::CollaborationRecord;

/// Errors surfaced to callers of the collaboration store.
#[derive(Error, Debug, Clone)]
pub enum CollabError {
    /// CAS failure: the record moved past the caller's expected version.
    #[error("version conflict on {}: latest version is {}", .latest.document_id, .latest.version)]
    VersionConflict { latest: Box<CollaborationRecord> },

    /// CAS retries exhausted without a successful commit.
    #[error("edit conflict on {document_id} after {attempts} attempts")]
    EditConflict { document_id: Uuid, attempts: u32 },

    #[error("permission denied: {actor} may not {action}")]
    PermissionDenied { actor: String, action: String },

    /// The mutation would leave the record without an admin.
    #[error("cannot remove or demote the last admin of {0}")]
    LastAdmin(Uuid),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl CollabError {
    /// Returns the latest record carried by a `VersionConflict`.
    pub fn latest(&self) -> Option<&CollaborationRecord> {
        match self {
            CollabError::VersionConflict { latest } => Some(latest),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CollabError::VersionConflict { .. })
    }
}

/// Storage backend errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("record already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A downstream notifier or task sink failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("external service `{service}` failed: {reason}")]
pub struct ExternalServiceError {
    pub service: String,
    pub reason: String,
}

impl ExternalServiceError {
    pub fn new(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            reason: reason.into(),
        }
    }
}

/// A single workflow action failed or timed out. Logged and audited only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("workflow rule {rule_id}: action `{action}` failed: {reason}")]
pub struct WorkflowActionError {
    pub rule_id: Uuid,
    pub action: &'static str,
    pub reason: String,
}
