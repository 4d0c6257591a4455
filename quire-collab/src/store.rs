//! Collaboration store: the single serialization point per document.
//!
//! ```text
//! caller ──► authorize (PermissionModel, against current state)
//!        ──► mutate a copy of the record
//!        ──► AuditLog::sequenced(events)          ─┐
//!              └─► backend.commit(Swap, events)    │ under the per-document
//!                  (record + audit, one batch)     │ commit lock
//!        ──► EventBus::publish(…)                 ─┘
//! ```
//!
//! A mutation is either stored together with its audit entries or not at all.
//!
//! Appends (comment, version entry, new collaborator) are commutative: if the
//! backend reports a concurrent write, the append is recomputed on the fresh
//! record and committed again. Overwrites (role, status, removal, resolved
//! flag, deadline) carry the caller's `expected_version`; a mismatch returns
//! `VersionConflict` with the latest record and nothing is written.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog};
use crate::broadcast::{ChangeEvent, ChangeKind, EventBus, Subscription};
use crate::error::{CollabError, StoreError};
use crate::model::{
    now_millis, validate_email, Actor, CollaborationRecord, Collaborator, CollaboratorStatus,
    Comment, RecordStatus, Role, VersionEntry,
};
use crate::permission::{Permission, PermissionModel};
use crate::storage::{CasOutcome, LedgerBackend, RecordBackend, RecordWrite};

/// How many times an append is recomputed when the backend reports a write
/// from outside this process before giving up.
const BACKEND_RACE_LIMIT: u32 = 16;

pub const DEFAULT_MAX_COMMENT_LEN: usize = 10_000;

/// Side effects of a mutation, applied after the CAS commits.
struct Mutation {
    audit: Vec<AuditEvent>,
    change: ChangeKind,
}

impl Mutation {
    fn new(audit: AuditEvent, change: ChangeKind) -> Self {
        Self {
            audit: vec![audit],
            change,
        }
    }
}

fn conflict(latest: CollaborationRecord) -> CollabError {
    CollabError::VersionConflict {
        latest: Box::new(latest),
    }
}

fn record_not_found(document_id: Uuid) -> CollabError {
    CollabError::NotFound(format!("collaboration record {document_id}"))
}

type LockMap = Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>;

fn lock_map(locks: &LockMap) -> MutexGuard<'_, HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A held document commit lock. The map entry goes away with the last holder.
struct DocumentLock<'a> {
    locks: &'a LockMap,
    document_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DocumentLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock_map(self.locks);
        // Only the map's own reference left: nobody holds or waits on it.
        if locks
            .get(&self.document_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.document_id);
        }
    }
}

pub struct CollaborationStore {
    backend: Arc<dyn LedgerBackend>,
    audit: Arc<AuditLog>,
    bus: Arc<EventBus>,
    /// Per-document commit locks, present only while held or awaited
    locks: LockMap,
    max_comment_len: usize,
}

impl CollaborationStore {
    /// `audit` must be built over the same `backend`, so that its sequence
    /// numbers follow what the backend commits.
    pub fn new(backend: Arc<dyn LedgerBackend>, audit: Arc<AuditLog>, bus: Arc<EventBus>) -> Self {
        Self {
            backend,
            audit,
            bus,
            locks: Mutex::new(HashMap::new()),
            max_comment_len: DEFAULT_MAX_COMMENT_LEN,
        }
    }

    pub fn with_max_comment_len(mut self, max: usize) -> Self {
        self.max_comment_len = max;
        self
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn subscribe(&self, document_id: Uuid) -> Subscription {
        self.bus.subscribe(document_id)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, document_id: Uuid) -> Result<CollaborationRecord, CollabError> {
        self.backend
            .get(document_id)?
            .ok_or_else(|| record_not_found(document_id))
    }

    pub fn list_documents(&self) -> Result<Vec<Uuid>, CollabError> {
        Ok(self.backend.list()?)
    }

    /// Records the given email collaborates on.
    pub fn documents_for(&self, email: &str) -> Result<Vec<CollaborationRecord>, CollabError> {
        let email = email.trim().to_ascii_lowercase();
        Ok(self.backend.filter(&|r| r.collaborator(&email).is_some())?)
    }

    /// Read the record as `actor`, leaving a `view` audit entry.
    pub async fn record_view(
        &self,
        document_id: Uuid,
        actor: &Actor,
    ) -> Result<CollaborationRecord, CollabError> {
        let _lock = self.lock_document(document_id).await;
        let record = self.get(document_id)?;
        PermissionModel::authorize(actor, Permission::Read, &record)?;
        self.audit
            .append(AuditEvent::new(document_id, actor, AuditAction::View, "record"))?;
        Ok(record)
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Create the record with `owner` as its first admin.
    pub async fn create(
        &self,
        document_id: Uuid,
        owner: &str,
    ) -> Result<CollaborationRecord, CollabError> {
        let owner = validate_email(owner)?;
        let _lock = self.lock_document(document_id).await;

        let record = CollaborationRecord::new(document_id, &owner, now_millis());
        let actor = Actor::User(owner.clone());
        let event = AuditEvent::new(document_id, &actor, AuditAction::Edit, "record")
            .with_meta("op", "create")
            .with_meta("owner", &owner);
        self.write(RecordWrite::Insert(&record), Mutation::new(event, ChangeKind::Created), &actor)
            .map_err(|e| match e {
                CollabError::Storage(StoreError::AlreadyExists(id)) => {
                    CollabError::Validation(format!("collaboration record {id} already exists"))
                }
                other => other,
            })?;
        log::info!("Created collaboration record {document_id} owned by {owner}");
        Ok(record)
    }

    /// Fetch the record, creating it lazily on first collaboration action.
    pub async fn ensure_record(
        &self,
        document_id: Uuid,
        owner: &str,
    ) -> Result<CollaborationRecord, CollabError> {
        if let Some(record) = self.backend.get(document_id)? {
            return Ok(record);
        }
        match self.create(document_id, owner).await {
            // Lost a creation race; the winner's record stands.
            Err(CollabError::Validation(e)) => match self.backend.get(document_id)? {
                Some(record) => Ok(record),
                None => Err(CollabError::Validation(e)),
            },
            other => other,
        }
    }

    /// Delete the record (cascade from document deletion). Admin only.
    ///
    /// The audit ledger for the document is kept.
    pub async fn delete(&self, document_id: Uuid, actor: &Actor) -> Result<(), CollabError> {
        let _lock = self.lock_document(document_id).await;
        let record = self.get(document_id)?;
        PermissionModel::authorize(actor, Permission::DeleteRecord, &record)?;
        let event = AuditEvent::new(document_id, actor, AuditAction::Edit, "record")
            .with_meta("op", "delete");
        self.write(RecordWrite::Delete(document_id), Mutation::new(event, ChangeKind::Deleted), actor)?;
        self.bus.close(document_id);
        log::info!("Deleted collaboration record {document_id}");
        Ok(())
    }

    // ─── Commutative appends ──────────────────────────────────────────

    pub async fn append_comment(
        &self,
        document_id: Uuid,
        actor: &Actor,
        content: &str,
        section: Option<&str>,
    ) -> Result<Comment, CollabError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(CollabError::Validation("comment is empty".into()));
        }
        if content.chars().count() > self.max_comment_len {
            return Err(CollabError::Validation(format!(
                "comment exceeds {} characters",
                self.max_comment_len
            )));
        }
        let section = section.map(str::trim).filter(|s| !s.is_empty());

        let (_, comment) = self
            .commit(document_id, actor, None, |record| {
                PermissionModel::authorize(actor, Permission::Comment, record)?;
                let comment = Comment {
                    id: Uuid::new_v4(),
                    author: actor.label(),
                    content: content.to_string(),
                    section: section.map(str::to_string),
                    created_at: now_millis(),
                    resolved: false,
                };
                record.comments.push(comment.clone());

                let mut event =
                    AuditEvent::new(document_id, actor, AuditAction::Comment, comment.id.to_string());
                if let Some(section) = &comment.section {
                    event = event.with_meta("section", section);
                }
                let change = ChangeKind::CommentAdded {
                    comment: comment.clone(),
                };
                Ok((Mutation::new(event, change), comment))
            })
            .await?;
        Ok(comment)
    }

    /// Append a version entry numbered one past the current latest.
    pub async fn append_version(
        &self,
        document_id: Uuid,
        actor: &Actor,
        changes_description: &str,
        size_bytes: u64,
    ) -> Result<VersionEntry, CollabError> {
        let description = changes_description.trim().to_string();

        let (_, entry) = self
            .commit(document_id, actor, None, |record| {
                PermissionModel::authorize(actor, Permission::CreateVersion, record)?;
                let entry = VersionEntry {
                    version: record.latest_version_number() + 1,
                    author: actor.label(),
                    changes_description: description.clone(),
                    created_at: now_millis(),
                    size_bytes,
                };
                record.version_history.push(entry.clone());

                let event = AuditEvent::new(
                    document_id,
                    actor,
                    AuditAction::VersionCreate,
                    format!("v{}", entry.version),
                )
                .with_meta("size_bytes", size_bytes);
                let change = ChangeKind::VersionAdded {
                    entry: entry.clone(),
                };
                Ok((Mutation::new(event, change), entry))
            })
            .await?;
        Ok(entry)
    }

    /// Invite a new collaborator. Fails if the email is already present.
    pub async fn add_collaborator(
        &self,
        document_id: Uuid,
        actor: &Actor,
        email: &str,
        role: Role,
    ) -> Result<CollaborationRecord, CollabError> {
        let email = validate_email(email)?;

        let (record, _) = self
            .commit(document_id, actor, None, |record| {
                PermissionModel::authorize(actor, Permission::ManageCollaborators, record)?;
                if record.collaborator(&email).is_some() {
                    return Err(CollabError::Validation(format!(
                        "{email} is already a collaborator"
                    )));
                }
                record.collaborators.push(Collaborator {
                    email: email.clone(),
                    role,
                    joined_at: now_millis(),
                    status: CollaboratorStatus::Invited,
                });

                let event = AuditEvent::new(document_id, actor, AuditAction::Invite, &email)
                    .with_meta("role", role);
                let change = ChangeKind::CollaboratorsChanged {
                    collaborators: record.collaborators.clone(),
                };
                Ok((Mutation::new(event, change), ()))
            })
            .await?;
        Ok(record)
    }

    // ─── CAS overwrites ───────────────────────────────────────────────

    /// Invited collaborator accepts; only the invitee may do this.
    pub async fn accept_invite(
        &self,
        document_id: Uuid,
        actor: &Actor,
    ) -> Result<CollaborationRecord, CollabError> {
        let email = actor
            .email()
            .ok_or_else(|| CollabError::Validation("only users accept invitations".into()))?
            .to_string();

        let (record, _) = self
            .commit(document_id, actor, None, |record| {
                let collaborator = record.collaborator_mut(&email).ok_or_else(|| {
                    CollabError::PermissionDenied {
                        actor: email.clone(),
                        action: "accept an invitation".into(),
                    }
                })?;
                if collaborator.status == CollaboratorStatus::Active {
                    return Err(CollabError::Validation(format!("{email} is already active")));
                }
                collaborator.status = CollaboratorStatus::Active;

                let event = AuditEvent::new(document_id, actor, AuditAction::Edit, format!("collaborator:{email}"))
                    .with_meta("status", "active");
                let change = ChangeKind::CollaboratorsChanged {
                    collaborators: record.collaborators.clone(),
                };
                Ok((Mutation::new(event, change), ()))
            })
            .await?;
        Ok(record)
    }

    pub async fn change_role(
        &self,
        document_id: Uuid,
        actor: &Actor,
        email: &str,
        role: Role,
        expected_version: u64,
    ) -> Result<CollaborationRecord, CollabError> {
        let email = validate_email(email)?;

        let (record, _) = self
            .commit(document_id, actor, Some(expected_version), |record| {
                PermissionModel::authorize(actor, Permission::ChangeRole, record)?;
                let mut updated = record.collaborators.clone();
                let collaborator = updated
                    .iter_mut()
                    .find(|c| c.email.eq_ignore_ascii_case(&email))
                    .ok_or_else(|| CollabError::NotFound(format!("collaborator {email}")))?;
                let previous = collaborator.role;
                collaborator.role = role;
                PermissionModel::ensure_admin_remains(record, &updated)?;
                record.collaborators = updated;

                let event = AuditEvent::new(document_id, actor, AuditAction::RoleChange, &email)
                    .with_meta("from", previous)
                    .with_meta("to", role);
                let change = ChangeKind::CollaboratorsChanged {
                    collaborators: record.collaborators.clone(),
                };
                Ok((Mutation::new(event, change), ()))
            })
            .await?;
        Ok(record)
    }

    pub async fn remove_collaborator(
        &self,
        document_id: Uuid,
        actor: &Actor,
        email: &str,
        expected_version: u64,
    ) -> Result<CollaborationRecord, CollabError> {
        let email = validate_email(email)?;

        let (record, _) = self
            .commit(document_id, actor, Some(expected_version), |record| {
                PermissionModel::authorize(actor, Permission::ManageCollaborators, record)?;
                let previous = record
                    .role_of(&email)
                    .ok_or_else(|| CollabError::NotFound(format!("collaborator {email}")))?;
                let remaining: Vec<Collaborator> = record
                    .collaborators
                    .iter()
                    .filter(|c| !c.email.eq_ignore_ascii_case(&email))
                    .cloned()
                    .collect();
                PermissionModel::ensure_admin_remains(record, &remaining)?;
                record.collaborators = remaining;

                let event = AuditEvent::new(document_id, actor, AuditAction::RoleChange, &email)
                    .with_meta("from", previous)
                    .with_meta("to", "removed");
                let change = ChangeKind::CollaboratorsChanged {
                    collaborators: record.collaborators.clone(),
                };
                Ok((Mutation::new(event, change), ()))
            })
            .await?;
        Ok(record)
    }

    pub async fn toggle_comment_resolved(
        &self,
        document_id: Uuid,
        actor: &Actor,
        comment_id: Uuid,
        expected_version: u64,
    ) -> Result<CollaborationRecord, CollabError> {
        let (record, _) = self
            .commit(document_id, actor, Some(expected_version), |record| {
                PermissionModel::authorize(actor, Permission::ResolveComment, record)?;
                let comment = record
                    .comments
                    .iter_mut()
                    .find(|c| c.id == comment_id)
                    .ok_or_else(|| CollabError::NotFound(format!("comment {comment_id}")))?;
                comment.resolved = !comment.resolved;
                let resolved = comment.resolved;

                let event = AuditEvent::new(document_id, actor, AuditAction::Edit, format!("comment:{comment_id}"))
                    .with_meta("resolved", resolved);
                let change = ChangeKind::CommentResolved { comment_id, resolved };
                Ok((Mutation::new(event, change), ()))
            })
            .await?;
        Ok(record)
    }

    pub async fn change_status(
        &self,
        document_id: Uuid,
        actor: &Actor,
        status: RecordStatus,
        expected_version: u64,
    ) -> Result<CollaborationRecord, CollabError> {
        let (record, _) = self
            .commit(document_id, actor, Some(expected_version), |record| {
                PermissionModel::authorize(actor, Permission::ChangeStatus, record)?;
                let from = record.status;
                record.status = status;

                let event = AuditEvent::new(document_id, actor, AuditAction::Edit, "status")
                    .with_meta("from", from)
                    .with_meta("to", status);
                let change = ChangeKind::StatusChanged { from, to: status };
                Ok((Mutation::new(event, change), ()))
            })
            .await?;
        Ok(record)
    }

    /// Set or clear the review deadline (epoch milliseconds).
    pub async fn set_deadline(
        &self,
        document_id: Uuid,
        actor: &Actor,
        deadline: Option<u64>,
        expected_version: u64,
    ) -> Result<CollaborationRecord, CollabError> {
        let (record, _) = self
            .commit(document_id, actor, Some(expected_version), |record| {
                PermissionModel::authorize(actor, Permission::SetDeadline, record)?;
                record.deadline = deadline;

                let mut event = AuditEvent::new(document_id, actor, AuditAction::Edit, "deadline");
                if let Some(at) = deadline {
                    event = event.with_meta("deadline_at", at);
                }
                Ok((Mutation::new(event, ChangeKind::DeadlineChanged { deadline }), ()))
            })
            .await?;
        Ok(record)
    }

    // ─── Audit-only actions ───────────────────────────────────────────

    /// Mark a restore of `version`. Metadata only: the record's version
    /// history is not rewritten and no content is rolled back here.
    pub async fn restore_version(
        &self,
        document_id: Uuid,
        actor: &Actor,
        version: u64,
    ) -> Result<AuditEvent, CollabError> {
        let _lock = self.lock_document(document_id).await;
        let record = self.get(document_id)?;
        PermissionModel::authorize(actor, Permission::RestoreVersion, &record)?;
        if !record.version_history.iter().any(|v| v.version == version) {
            return Err(CollabError::NotFound(format!("version {version} of {document_id}")));
        }

        let event = AuditEvent::new(document_id, actor, AuditAction::VersionRestore, format!("v{version}"))
            .with_meta("latest", record.latest_version_number());
        let appended = self.audit.append(event)?;
        self.bus.publish(
            document_id,
            ChangeEvent {
                document_id,
                record_version: record.version,
                actor: actor.label(),
                kind: ChangeKind::VersionRestored { version },
            },
        );
        Ok(appended)
    }

    /// Audit that the document was shared with `recipient`.
    pub async fn record_share(
        &self,
        document_id: Uuid,
        actor: &Actor,
        recipient: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<AuditEvent, CollabError> {
        let recipient = validate_email(recipient)?;
        let _lock = self.lock_document(document_id).await;
        let record = self.get(document_id)?;
        PermissionModel::authorize(actor, Permission::Share, &record)?;
        Ok(self
            .audit
            .record(document_id, actor, AuditAction::Share, recipient, metadata)?)
    }

    // ─── Internals ────────────────────────────────────────────────────

    async fn lock_document(&self, document_id: Uuid) -> DocumentLock<'_> {
        let lock = lock_map(&self.locks).entry(document_id).or_default().clone();
        DocumentLock {
            locks: &self.locks,
            document_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Read-mutate-CAS under the document lock.
    ///
    /// With `expected_version` set, any version mismatch is returned to the
    /// caller. Without it, backend races are retried on the fresh record.
    async fn commit<T, F>(
        &self,
        document_id: Uuid,
        actor: &Actor,
        expected_version: Option<u64>,
        mut mutate: F,
    ) -> Result<(CollaborationRecord, T), CollabError>
    where
        F: FnMut(&mut CollaborationRecord) -> Result<(Mutation, T), CollabError>,
    {
        let _lock = self.lock_document(document_id).await;

        for _ in 0..BACKEND_RACE_LIMIT {
            let current = self.get(document_id)?;
            if let Some(expected) = expected_version {
                if current.version != expected {
                    return Err(conflict(current));
                }
            }

            let mut next = current.clone();
            let (mutation, output) = mutate(&mut next)?;
            next.touch(now_millis());

            let write = RecordWrite::Swap {
                record: &next,
                expected_version: current.version,
            };
            match self.write(write, mutation, actor)? {
                CasOutcome::Committed(record) => return Ok((record, output)),
                CasOutcome::Conflict(latest) if expected_version.is_some() => {
                    return Err(conflict(latest));
                }
                CasOutcome::Conflict(latest) => {
                    log::debug!(
                        "Concurrent write on {document_id} (v{}), recomputing append",
                        latest.version
                    );
                }
                CasOutcome::Missing => return Err(record_not_found(document_id)),
            }
        }

        Err(CollabError::EditConflict {
            document_id,
            attempts: BACKEND_RACE_LIMIT,
        })
    }

    /// Commit `write` with the mutation's audit events in one backend call,
    /// then publish the change.
    fn write(
        &self,
        write: RecordWrite<'_>,
        mutation: Mutation,
        actor: &Actor,
    ) -> Result<CasOutcome, CollabError> {
        let document_id = write.document_id();
        let (outcome, _) = self.audit.sequenced(mutation.audit, |events| {
            let outcome = self.backend.commit(write, events)?;
            let stored = matches!(outcome, CasOutcome::Committed(_));
            Ok((outcome, stored))
        })?;

        match outcome {
            CasOutcome::Committed(record) => {
                self.bus.publish(
                    document_id,
                    ChangeEvent {
                        document_id,
                        record_version: record.version,
                        actor: actor.label(),
                        kind: mutation.change,
                    },
                );
                Ok(CasOutcome::Committed(record))
            }
            CasOutcome::Missing => Err(record_not_found(document_id)),
            other => Ok(other),
        }
    }
}
