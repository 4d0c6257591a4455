//! # quire-collab — Collaboration & versioning core for Quire documents
//!
//! Shared per-document collaboration state (collaborators and roles, comment
//! thread, version history, review status), an append-only audit ledger, live
//! change fan-out, presence and rule-based automation.
//!
//! ## Architecture
//!
//! ```text
//! client action
//!      │
//!      ▼
//! ┌──────────────────┐  authorize   ┌─────────────────┐
//! │CollaborationStore│ ───────────► │ PermissionModel │
//! │ (CAS per record) │              └─────────────────┘
//! └───┬──────────┬───┘
//!     │          │ publish                ┌───────────────┐
//!     │          └──────────────────────► │   EventBus    │ ──► subscribers
//!     │ append                            └───────────────┘
//!     ▼
//! ┌──────────┐  feed   ┌────────────────┐  actions  ┌──────────────────────┐
//! │ AuditLog │ ──────► │ WorkflowEngine │ ────────► │ Notifier / TaskSink  │
//! └──────────┘         └────────────────┘           └──────────────────────┘
//!
//! PresenceTracker (heartbeats, timeout sweep) sits beside all of this.
//! ```
//!
//! ## Modules
//!
//! - [`model`] — records, collaborators, comments, versions, actors
//! - [`permission`] — role hierarchy and authorization
//! - [`store`] — optimistic-concurrency record store
//! - [`retry`] — bounded retry for conflicting overwrites
//! - [`audit`] — append-only audit ledger and export rows
//! - [`broadcast`] — per-document change fan-out
//! - [`presence`] — best-effort online state
//! - [`workflow`] — automation rules and their interpreter
//! - [`storage`] — in-memory and RocksDB backends
//! - [`service`] — everything wired from a [`CollabConfig`]

pub mod audit;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod model;
pub mod permission;
pub mod presence;
pub mod retry;
pub mod service;
pub mod storage;
pub mod store;
pub mod workflow;

// Re-exports for convenience
pub use audit::{AuditAction, AuditEvent, AuditFilter, AuditLog, AuditRow};
pub use broadcast::{BusStats, ChangeEvent, ChangeKind, EventBus, Subscription};
pub use config::CollabConfig;
pub use error::{CollabError, ExternalServiceError, StoreError, WorkflowActionError};
pub use model::{
    Actor, CollaborationRecord, Collaborator, CollaboratorStatus, Comment, RecordStatus, Role,
    VersionEntry,
};
pub use permission::{Permission, PermissionModel};
pub use presence::{PresenceEntry, PresenceRegistry, PresenceTracker};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use service::{CollabService, ServiceStats};
pub use storage::{
    AuditBackend, CasOutcome, LedgerBackend, MemoryBackend, RecordBackend, RecordWrite,
    RocksBackend, StoreConfig,
};
pub use store::CollaborationStore;
pub use workflow::{
    ActionOutcome, MemoryTaskSink, Notification, Notifier, RecordingNotifier, RuleScope,
    TaskRequest, TaskSink, Trigger, WorkflowAction, WorkflowEngine, WorkflowRule,
};
