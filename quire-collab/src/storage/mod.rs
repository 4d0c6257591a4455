//! Persistence contract for collaboration records and the audit ledger.
//!
//! ```text
//! ┌────────────────────┐  insert / get / filter / CAS   ┌────────────────┐
//! │ CollaborationStore │ ─────────────────────────────► │ RecordBackend  │
//! └─────────┬──────────┘                                └────────────────┘
//!           │ append / scan                             ┌────────────────┐
//!           └─────────────────────────────────────────► │ AuditBackend   │
//!                                                       └────────────────┘
//!                        MemoryBackend   (tests, single process)
//!                        RocksBackend    (RocksDB column families)
//! ```
//!
//! [`LedgerBackend`] joins the two: a record write and the audit events that
//! describe it land in one atomic unit, so the ledger never disagrees with
//! the record. The core depends only on these traits. Change subscription is served
//! by the [`EventBus`](crate::broadcast::EventBus), which the store feeds
//! after every commit.

pub mod memory;
pub mod rocks;

pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, StoreConfig};

use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::error::StoreError;
use crate::model::CollaborationRecord;

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Committed(CollaborationRecord),
    /// The stored version did not match; carries what is stored now.
    Conflict(CollaborationRecord),
    Missing,
}

/// Record write applied together with its audit events.
#[derive(Debug, Clone, Copy)]
pub enum RecordWrite<'a> {
    /// Fails with `AlreadyExists` if the key is taken.
    Insert(&'a CollaborationRecord),
    Swap {
        record: &'a CollaborationRecord,
        expected_version: u64,
    },
    Delete(Uuid),
}

impl RecordWrite<'_> {
    pub fn document_id(&self) -> Uuid {
        match self {
            RecordWrite::Insert(record) | RecordWrite::Swap { record, .. } => record.document_id,
            RecordWrite::Delete(id) => *id,
        }
    }
}

/// Keyed, filterable record storage with conditional update.
pub trait RecordBackend: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the key is taken.
    fn insert(&self, record: &CollaborationRecord) -> Result<(), StoreError>;

    fn get(&self, document_id: Uuid) -> Result<Option<CollaborationRecord>, StoreError>;

    /// All records matching `predicate`.
    fn filter(
        &self,
        predicate: &dyn Fn(&CollaborationRecord) -> bool,
    ) -> Result<Vec<CollaborationRecord>, StoreError>;

    /// Store `record` only if the stored version equals `expected_version`.
    fn compare_and_swap(
        &self,
        record: &CollaborationRecord,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError>;

    /// Returns whether a record was removed.
    fn delete(&self, document_id: Uuid) -> Result<bool, StoreError>;

    fn list(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Append-only audit storage. There is intentionally no delete.
pub trait AuditBackend: Send + Sync {
    fn append(&self, event: &AuditEvent) -> Result<(), StoreError>;

    /// Events of a document ordered by sequence.
    fn scan(&self, document_id: Uuid) -> Result<Vec<AuditEvent>, StoreError>;

    fn last_sequence(&self, document_id: Uuid) -> Result<Option<u64>, StoreError>;
}

/// Record and audit storage sharing one commit.
pub trait LedgerBackend: RecordBackend + AuditBackend {
    /// Apply `write` and append `events` as one unit.
    ///
    /// Returns `Committed` with the stored (or, for `Delete`, removed) record.
    /// On `Conflict` or `Missing` nothing is written.
    fn commit(&self, write: RecordWrite<'_>, events: &[AuditEvent]) -> Result<CasOutcome, StoreError>;
}
