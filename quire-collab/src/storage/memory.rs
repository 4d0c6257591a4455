//! In-process backend. Used by tests and single-node deployments that do not
//! need durability.

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{AuditBackend, CasOutcome, LedgerBackend, RecordBackend, RecordWrite};
use crate::audit::AuditEvent;
use crate::error::StoreError;
use crate::model::CollaborationRecord;

fn poisoned() -> StoreError {
    StoreError::Database("memory backend lock poisoned".into())
}

#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<Uuid, CollaborationRecord>>,
    audit: RwLock<HashMap<Uuid, Vec<AuditEvent>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordBackend for MemoryBackend {
    fn insert(&self, record: &CollaborationRecord) -> Result<(), StoreError> {
        self.commit(RecordWrite::Insert(record), &[]).map(|_| ())
    }

    fn get(&self, document_id: Uuid) -> Result<Option<CollaborationRecord>, StoreError> {
        Ok(self.records.read().map_err(|_| poisoned())?.get(&document_id).cloned())
    }

    fn filter(
        &self,
        predicate: &dyn Fn(&CollaborationRecord) -> bool,
    ) -> Result<Vec<CollaborationRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect())
    }

    fn compare_and_swap(
        &self,
        record: &CollaborationRecord,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        self.commit(
            RecordWrite::Swap {
                record,
                expected_version,
            },
            &[],
        )
    }

    fn delete(&self, document_id: Uuid) -> Result<bool, StoreError> {
        Ok(matches!(
            self.commit(RecordWrite::Delete(document_id), &[])?,
            CasOutcome::Committed(_)
        ))
    }

    fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.records.read().map_err(|_| poisoned())?.keys().copied().collect())
    }
}

impl LedgerBackend for MemoryBackend {
    fn commit(&self, write: RecordWrite<'_>, events: &[AuditEvent]) -> Result<CasOutcome, StoreError> {
        // Lock order: records, then audit.
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let mut audit = self.audit.write().map_err(|_| poisoned())?;

        let outcome = match write {
            RecordWrite::Insert(record) => {
                if records.contains_key(&record.document_id) {
                    return Err(StoreError::AlreadyExists(record.document_id));
                }
                records.insert(record.document_id, record.clone());
                CasOutcome::Committed(record.clone())
            }
            RecordWrite::Swap {
                record,
                expected_version,
            } => match records.get_mut(&record.document_id) {
                None => return Ok(CasOutcome::Missing),
                Some(stored) if stored.version != expected_version => {
                    return Ok(CasOutcome::Conflict(stored.clone()))
                }
                Some(stored) => {
                    *stored = record.clone();
                    CasOutcome::Committed(record.clone())
                }
            },
            RecordWrite::Delete(document_id) => match records.remove(&document_id) {
                None => return Ok(CasOutcome::Missing),
                Some(removed) => CasOutcome::Committed(removed),
            },
        };

        for event in events {
            audit.entry(event.document_id).or_default().push(event.clone());
        }
        Ok(outcome)
    }
}

impl AuditBackend for MemoryBackend {
    fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.audit
            .write()
            .map_err(|_| poisoned())?
            .entry(event.document_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn scan(&self, document_id: Uuid) -> Result<Vec<AuditEvent>, StoreError> {
        let mut events = self
            .audit
            .read()
            .map_err(|_| poisoned())?
            .get(&document_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    fn last_sequence(&self, document_id: Uuid) -> Result<Option<u64>, StoreError> {
        Ok(self
            .audit
            .read()
            .map_err(|_| poisoned())?
            .get(&document_id)
            .and_then(|events| events.iter().map(|e| e.sequence).max()))
    }
}
