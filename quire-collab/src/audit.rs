//! Append-only audit ledger.
//!
//! Every committed mutation lands here as an [`AuditEvent`]. The ledger has
//! no update or delete path: the only writes are [`AuditLog::append`] and
//! [`AuditLog::record`]. Each appended event is also pushed into the workflow
//! feed so automation rules can react to it.
//!
//! Sequence numbers are assigned per document under a lock, so
//! `query` order is append order even when timestamps collide.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CollabError, StoreError};
use crate::model::{now_millis, Actor};
use crate::storage::AuditBackend;

/// Kind of audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Edit,
    Comment,
    Invite,
    View,
    Share,
    RoleChange,
    VersionCreate,
    VersionRestore,
    WorkflowRun,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Edit => "edit",
            AuditAction::Comment => "comment",
            AuditAction::Invite => "invite",
            AuditAction::View => "view",
            AuditAction::Share => "share",
            AuditAction::RoleChange => "role_change",
            AuditAction::VersionCreate => "version_create",
            AuditAction::VersionRestore => "version_restore",
            AuditAction::WorkflowRun => "workflow_run",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "edit" => AuditAction::Edit,
            "comment" => AuditAction::Comment,
            "invite" => AuditAction::Invite,
            "view" => AuditAction::View,
            "share" => AuditAction::Share,
            "role_change" => AuditAction::RoleChange,
            "version_create" => AuditAction::VersionCreate,
            "version_restore" => AuditAction::VersionRestore,
            "workflow_run" => AuditAction::WorkflowRun,
            other => {
                return Err(CollabError::Validation(format!("unknown audit action `{other}`")))
            }
        })
    }
}

/// Immutable record of a state-changing (or audited read) action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Per-document append order, assigned by the log
    pub sequence: u64,
    pub actor: String,
    pub action: AuditAction,
    pub target: String,
    pub timestamp: u64,
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(
        document_id: Uuid,
        actor: &Actor,
        action: AuditAction,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            sequence: 0,
            actor: actor.label(),
            action,
            target: target.into(),
            timestamp: now_millis(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Events written by workflow actors never re-trigger rules.
    pub fn is_from_workflow(&self) -> bool {
        self.actor.starts_with("workflow:")
    }
}

/// Query filter. All fields are optional; `from`/`to` are inclusive.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl AuditFilter {
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn between(mut self, from: u64, to: u64) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.actor.as_ref().is_none_or(|a| a.eq_ignore_ascii_case(&event.actor))
            && self.action.is_none_or(|a| a == event.action)
            && self.from.is_none_or(|from| event.timestamp >= from)
            && self.to.is_none_or(|to| event.timestamp <= to)
    }
}

/// Flat export row for CSV/report generators.
///
/// Metadata is carried as a JSON object string so rows stay one level deep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub id: String,
    pub document_id: String,
    pub sequence: u64,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub timestamp: u64,
    pub metadata: String,
}

impl From<&AuditEvent> for AuditRow {
    fn from(event: &AuditEvent) -> Self {
        Self {
            id: event.id.to_string(),
            document_id: event.document_id.to_string(),
            sequence: event.sequence,
            actor: event.actor.clone(),
            action: event.action.to_string(),
            target: event.target.clone(),
            timestamp: event.timestamp,
            metadata: serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".into()),
        }
    }
}

impl TryFrom<AuditRow> for AuditEvent {
    type Error = CollabError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let parse_id = |s: &str| {
            Uuid::parse_str(s).map_err(|e| CollabError::Validation(format!("bad uuid `{s}`: {e}")))
        };
        let metadata = serde_json::from_str(&row.metadata)
            .map_err(|e| CollabError::Validation(format!("bad metadata: {e}")))?;
        Ok(Self {
            id: parse_id(&row.id)?,
            document_id: parse_id(&row.document_id)?,
            sequence: row.sequence,
            actor: row.actor,
            action: row.action.parse()?,
            target: row.target,
            timestamp: row.timestamp,
            metadata,
        })
    }
}

/// The audit ledger.
pub struct AuditLog {
    backend: Arc<dyn AuditBackend>,
    /// Next sequence per document, lazily seeded from the backend
    next_sequence: Mutex<HashMap<Uuid, u64>>,
    /// Workflow feed (None = no automation attached)
    feed: Option<mpsc::UnboundedSender<AuditEvent>>,
}

impl AuditLog {
    pub fn new(backend: Arc<dyn AuditBackend>) -> Self {
        Self {
            backend,
            next_sequence: Mutex::new(HashMap::new()),
            feed: None,
        }
    }

    /// Forward every appended event to `feed`.
    pub fn with_feed(mut self, feed: mpsc::UnboundedSender<AuditEvent>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Append an event. The log assigns its sequence number.
    ///
    /// Fails only on storage-layer errors.
    pub fn append(&self, event: AuditEvent) -> Result<AuditEvent, StoreError> {
        let (_, mut events) = self.sequenced(vec![event], |events| {
            for event in events {
                self.backend.append(event)?;
            }
            Ok(((), true))
        })?;
        events
            .pop()
            .ok_or_else(|| StoreError::Database("audit append produced no event".into()))
    }

    /// Number `events` and hand them to `write`, which persists them together
    /// with whatever else belongs in the same commit. `write` reports whether
    /// the events were stored; only then do sequences advance and the events
    /// reach the workflow feed.
    pub fn sequenced<T>(
        &self,
        mut events: Vec<AuditEvent>,
        write: impl FnOnce(&[AuditEvent]) -> Result<(T, bool), StoreError>,
    ) -> Result<(T, Vec<AuditEvent>), StoreError> {
        let (output, stored) = {
            let mut sequences = self
                .next_sequence
                .lock()
                .map_err(|_| StoreError::Database("audit sequence lock poisoned".into()))?;
            let mut assigned: HashMap<Uuid, u64> = HashMap::new();
            for event in events.iter_mut() {
                let next = match assigned.get(&event.document_id).or(sequences.get(&event.document_id)) {
                    Some(next) => *next,
                    None => self
                        .backend
                        .last_sequence(event.document_id)?
                        .map_or(0, |last| last + 1),
                };
                event.sequence = next;
                assigned.insert(event.document_id, next + 1);
            }
            let (output, stored) = write(&events)?;
            if stored {
                sequences.extend(assigned);
            }
            (output, stored)
        };

        if stored {
            for event in &events {
                self.emit(event);
            }
        }
        Ok((output, events))
    }

    fn emit(&self, event: &AuditEvent) {
        log::debug!(
            "Audit {} #{} on {} by {}",
            event.action,
            event.sequence,
            event.document_id,
            event.actor
        );
        if let Some(feed) = &self.feed {
            if feed.send(event.clone()).is_err() {
                log::debug!("Workflow feed closed; event {} not evaluated", event.id);
            }
        }
    }

    /// Build and append an event in one call.
    pub fn record(
        &self,
        document_id: Uuid,
        actor: &Actor,
        action: AuditAction,
        target: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<AuditEvent, StoreError> {
        let mut event = AuditEvent::new(document_id, actor, action, target);
        event.metadata = metadata;
        self.append(event)
    }

    /// Events for a document in append order.
    pub fn query(&self, document_id: Uuid, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self
            .backend
            .scan(document_id)?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }

    /// Export rows for an external report generator.
    pub fn export(&self, document_id: Uuid, filter: &AuditFilter) -> Result<Vec<AuditRow>, StoreError> {
        Ok(self.query(document_id, filter)?.iter().map(AuditRow::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn log() -> AuditLog {
        AuditLog::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn test_append_assigns_sequence() {
        let log = log();
        let doc = Uuid::new_v4();
        let actor = Actor::user("a@example.com");

        for i in 0..3 {
            let ev = log.append(AuditEvent::new(doc, &actor, AuditAction::View, "record")).unwrap();
            assert_eq!(ev.sequence, i);
        }
        // Other documents have their own sequence.
        let other = log.append(AuditEvent::new(Uuid::new_v4(), &actor, AuditAction::View, "record")).unwrap();
        assert_eq!(other.sequence, 0);
    }

    #[test]
    fn test_sequenced_advances_only_when_stored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log = log().with_feed(tx);
        let doc = Uuid::new_v4();
        let actor = Actor::user("a@example.com");
        let batch = || {
            vec![
                AuditEvent::new(doc, &actor, AuditAction::Invite, "b@example.com"),
                AuditEvent::new(doc, &actor, AuditAction::RoleChange, "b@example.com"),
            ]
        };

        let (_, rejected) = log.sequenced(batch(), |_| Ok(((), false))).unwrap();
        assert_eq!(rejected.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![0, 1]);
        assert!(rx.try_recv().is_err());

        let (_, stored) = log
            .sequenced(batch(), |events| {
                for event in events {
                    log.backend.append(event)?;
                }
                Ok(((), true))
            })
            .unwrap();
        assert_eq!(stored.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(rx.try_recv().unwrap().sequence, 0);
        assert_eq!(rx.try_recv().unwrap().sequence, 1);

        let next = log.append(AuditEvent::new(doc, &actor, AuditAction::View, "record")).unwrap();
        assert_eq!(next.sequence, 2);
    }

    #[test]
    fn test_query_filters() {
        let log = log();
        let doc = Uuid::new_v4();
        let alice = Actor::user("alice@example.com");
        let bob = Actor::user("bob@example.com");

        log.record(doc, &alice, AuditAction::Comment, "c1", BTreeMap::new()).unwrap();
        log.record(doc, &bob, AuditAction::Edit, "status", BTreeMap::new()).unwrap();
        log.record(doc, &alice, AuditAction::Edit, "deadline", BTreeMap::new()).unwrap();

        let all = log.query(doc, &AuditFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let alice_only = log.query(doc, &AuditFilter::default().actor("ALICE@example.com")).unwrap();
        assert_eq!(alice_only.len(), 2);

        let edits = log.query(doc, &AuditFilter::default().action(AuditAction::Edit)).unwrap();
        assert_eq!(edits.len(), 2);

        let none = log.query(doc, &AuditFilter::default().between(0, 1)).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_feed_receives_appends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log = log().with_feed(tx);
        let doc = Uuid::new_v4();
        let ev = log
            .record(doc, &Actor::user("a@example.com"), AuditAction::Invite, "b@example.com", BTreeMap::new())
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), ev);
    }

    #[test]
    fn test_row_roundtrip() {
        let doc = Uuid::new_v4();
        let event = AuditEvent::new(doc, &Actor::user("a@example.com"), AuditAction::RoleChange, "b@example.com")
            .with_meta("from", "viewer")
            .with_meta("to", "editor");
        let row = AuditRow::from(&event);
        assert_eq!(row.action, "role_change");
        assert_eq!(AuditEvent::try_from(row).unwrap(), event);
    }

    #[test]
    fn test_row_rejects_garbage() {
        let mut row = AuditRow::from(&AuditEvent::new(
            Uuid::new_v4(),
            &Actor::user("a@example.com"),
            AuditAction::View,
            "record",
        ));
        row.action = "delete".into();
        assert!(AuditEvent::try_from(row).is_err());
    }

    #[test]
    fn test_workflow_origin() {
        let ev = AuditEvent::new(Uuid::new_v4(), &Actor::Workflow(Uuid::new_v4()), AuditAction::Edit, "status");
        assert!(ev.is_from_workflow());
    }
}
