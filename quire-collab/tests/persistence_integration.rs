//! Persistence integration tests over RocksDB.
//!
//! Verifies:
//! - Record and audit ledger survive a restart
//! - Audit sequence numbering resumes after reopen
//! - CAS conflicts detected by the backend itself
//! - Concurrent appends against the durable backend lose nothing
//! - Multi-document isolation

use quire_collab::{
    Actor, AuditAction, AuditFilter, AuditLog, AuditBackend, CasOutcome, CollabError,
    CollaborationStore, EventBus, RecordBackend, RecordStatus, RocksBackend, Role, StoreConfig,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

const OWNER: &str = "owner@example.com";

fn open_store(path: &Path) -> (Arc<RocksBackend>, Arc<CollaborationStore>) {
    let backend = Arc::new(RocksBackend::open(StoreConfig::for_testing(path)).unwrap());
    let audit = Arc::new(AuditLog::new(backend.clone()));
    let store = Arc::new(CollaborationStore::new(backend.clone(), audit, Arc::new(EventBus::new(32))));
    (backend, store)
}

fn owner() -> Actor {
    Actor::user(OWNER)
}

// ─── Crash Recovery ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_record_and_audit_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let doc = Uuid::new_v4();

    // Phase 1: mutate, then drop everything (simulates a crash)
    let before = {
        let (_, store) = open_store(&db_path);
        store.create(doc, OWNER).await.unwrap();
        store.add_collaborator(doc, &owner(), "b@example.com", Role::Editor).await.unwrap();
        store.append_comment(doc, &owner(), "persist me", Some("Intro")).await.unwrap();
        store.append_version(doc, &owner(), "first draft", 2048).await.unwrap();
        let v = store.get(doc).unwrap().version;
        store.change_status(doc, &owner(), RecordStatus::InReview, v).await.unwrap();
        store.get(doc).unwrap()
    };

    // Phase 2: reopen
    let (_, store) = open_store(&db_path);
    let after = store.get(doc).unwrap();
    assert_eq!(after, before);
    assert_eq!(after.comments[0].content, "persist me");
    assert_eq!(after.version_history[0].size_bytes, 2048);
    assert_eq!(after.status, RecordStatus::InReview);

    let actions: Vec<AuditAction> = store
        .audit()
        .query(doc, &AuditFilter::default())
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::Edit,
            AuditAction::Invite,
            AuditAction::Comment,
            AuditAction::VersionCreate,
            AuditAction::Edit,
        ]
    );
}

#[tokio::test]
async fn test_audit_sequence_resumes_after_reopen() {
    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4();
    {
        let (_, store) = open_store(dir.path());
        store.create(doc, OWNER).await.unwrap();
        store.record_view(doc, &owner()).await.unwrap();
    }

    let (backend, store) = open_store(dir.path());
    assert_eq!(backend.last_sequence(doc).unwrap(), Some(1));
    store.append_comment(doc, &owner(), "after restart", None).await.unwrap();

    let sequences: Vec<u64> = store
        .audit()
        .query(doc, &AuditFilter::default())
        .unwrap()
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(sequences, vec![0, 1, 2]);
}

// ─── Concurrency against the durable backend ─────────────────────────────────

#[test]
fn test_backend_cas_rejects_stale_write() {
    let dir = tempdir().unwrap();
    let backend = RocksBackend::open(StoreConfig::for_testing(dir.path())).unwrap();
    let record = quire_collab::CollaborationRecord::new(Uuid::new_v4(), OWNER, 0);
    backend.insert(&record).unwrap();

    let mut first = record.clone();
    first.status = RecordStatus::Approved;
    first.version = 2;
    let mut second = record.clone();
    second.status = RecordStatus::Rejected;
    second.version = 2;

    assert!(matches!(backend.compare_and_swap(&first, 1).unwrap(), CasOutcome::Committed(_)));
    match backend.compare_and_swap(&second, 1).unwrap() {
        CasOutcome::Conflict(latest) => assert_eq!(latest.status, RecordStatus::Approved),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_durable() {
    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4();
    {
        let (_, store) = open_store(dir.path());
        store.create(doc, OWNER).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append_comment(doc, &Actor::user(OWNER), &format!("comment {i}"), None)
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    let (_, store) = open_store(dir.path());
    let record = store.get(doc).unwrap();
    assert_eq!(record.comments.len(), 10);
    assert_eq!(record.version, 11);
    assert_eq!(
        store
            .audit()
            .query(doc, &AuditFilter::default().action(AuditAction::Comment))
            .unwrap()
            .len(),
        10
    );
}

// ─── Isolation & lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_multi_document_isolation() {
    let dir = tempdir().unwrap();
    let (_, store) = open_store(dir.path());
    let docs: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

    for (i, doc) in docs.iter().enumerate() {
        store.create(*doc, &format!("owner{i}@example.com")).await.unwrap();
        for _ in 0..=i {
            store
                .append_version(*doc, &Actor::user(format!("owner{i}@example.com")), "edit", 1)
                .await
                .unwrap();
        }
    }

    for (i, doc) in docs.iter().enumerate() {
        let record = store.get(*doc).unwrap();
        assert_eq!(record.version_history.len(), i + 1);
        assert_eq!(store.audit().query(*doc, &AuditFilter::default()).unwrap().len(), i + 2);
    }

    let mine = store.documents_for("owner3@example.com").unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].document_id, docs[3]);

    let mut listed = store.list_documents().unwrap();
    listed.sort();
    let mut expected = docs.clone();
    expected.sort();
    assert_eq!(listed, expected);
}

#[tokio::test]
async fn test_delete_keeps_audit_on_disk() {
    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4();
    {
        let (_, store) = open_store(dir.path());
        store.create(doc, OWNER).await.unwrap();
        store.delete(doc, &owner()).await.unwrap();
    }

    let (_, store) = open_store(dir.path());
    assert!(matches!(store.get(doc), Err(CollabError::NotFound(_))));
    let events = store.audit().query(doc, &AuditFilter::default()).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].meta("op"), Some("delete"));
}
