//! Best-effort "who is looking at this document" state.
//!
//! ```text
//! client heartbeat ──► PresenceTracker::heartbeat()   (online, last_seen = now)
//! client closes    ──► PresenceTracker::leave()       (offline)
//! sweeper tick     ──► PresenceTracker::sweep()       (idle > timeout → offline)
//! ```
//!
//! Presence is ephemeral and lossy by nature. It is never persisted and never
//! consulted for authorization.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::model::now_millis;

pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of one user's presence on a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub email: String,
    pub online: bool,
    /// Epoch millis of the last heartbeat
    pub last_seen: u64,
}

/// Swappable presence backend.
#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    async fn heartbeat(&self, document_id: Uuid, email: &str);
    async fn leave(&self, document_id: Uuid, email: &str);
    /// Users currently online on the document, sorted by email.
    async fn online(&self, document_id: Uuid) -> Vec<PresenceEntry>;
    /// Mark idle users offline; returns who went offline.
    async fn sweep(&self) -> Vec<(Uuid, String)>;
}

#[derive(Debug, Clone)]
struct Peer {
    last_heartbeat: Instant,
    last_seen: u64,
    online: bool,
}

impl Peer {
    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }
}

/// In-process presence map: document → email → peer.
pub struct PresenceTracker {
    documents: RwLock<HashMap<Uuid, HashMap<String, Peer>>>,
    timeout: Duration,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TIMEOUT)
    }
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// All known entries for a document, online or not.
    pub async fn entries(&self, document_id: Uuid) -> Vec<PresenceEntry> {
        let documents = self.documents.read().await;
        let mut entries: Vec<PresenceEntry> = documents
            .get(&document_id)
            .map(|peers| {
                peers
                    .iter()
                    .map(|(email, p)| PresenceEntry {
                        email: email.clone(),
                        online: p.online,
                        last_seen: p.last_seen,
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.email.cmp(&b.email));
        entries
    }

    /// Sweep relative to `now`. Documents left with no online users are
    /// forgotten.
    pub async fn sweep_at(&self, now: Instant) -> Vec<(Uuid, String)> {
        let mut expired = Vec::new();
        let mut documents = self.documents.write().await;
        for (document_id, peers) in documents.iter_mut() {
            for (email, peer) in peers.iter_mut() {
                if peer.online && peer.is_idle(now, self.timeout) {
                    peer.online = false;
                    expired.push((*document_id, email.clone()));
                }
            }
        }
        documents.retain(|_, peers| peers.values().any(|p| p.online));

        if !expired.is_empty() {
            log::debug!("Presence sweep: {} user(s) went offline", expired.len());
        }
        expired
    }

    /// Run `sweep` every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_at(Instant::now()).await;
            }
        })
    }
}

#[async_trait]
impl PresenceRegistry for PresenceTracker {
    async fn heartbeat(&self, document_id: Uuid, email: &str) {
        let email = email.trim().to_ascii_lowercase();
        let mut documents = self.documents.write().await;
        let peers = documents.entry(document_id).or_default();
        let joined = !peers.get(&email).is_some_and(|p| p.online);
        peers.insert(
            email.clone(),
            Peer {
                last_heartbeat: Instant::now(),
                last_seen: now_millis(),
                online: true,
            },
        );
        if joined {
            log::debug!("{email} is now online on {document_id}");
        }
    }

    async fn leave(&self, document_id: Uuid, email: &str) {
        let email = email.trim().to_ascii_lowercase();
        let mut documents = self.documents.write().await;
        if let Some(peer) = documents
            .get_mut(&document_id)
            .and_then(|peers| peers.get_mut(&email))
        {
            peer.online = false;
        }
    }

    async fn online(&self, document_id: Uuid) -> Vec<PresenceEntry> {
        let mut entries = self.entries(document_id).await;
        entries.retain(|e| e.online);
        entries
    }

    async fn sweep(&self) -> Vec<(Uuid, String)> {
        self.sweep_at(Instant::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emails(entries: &[PresenceEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.email.as_str()).collect()
    }

    #[tokio::test]
    async fn test_heartbeat_and_online() {
        let tracker = PresenceTracker::default();
        let doc = Uuid::new_v4();
        tracker.heartbeat(doc, "B@example.com").await;
        tracker.heartbeat(doc, "a@example.com").await;
        tracker.heartbeat(doc, "a@example.com").await;

        let online = tracker.online(doc).await;
        assert_eq!(emails(&online), vec!["a@example.com", "b@example.com"]);
        assert!(tracker.online(Uuid::new_v4()).await.is_empty());
    }

    #[tokio::test]
    async fn test_leave() {
        let tracker = PresenceTracker::default();
        let doc = Uuid::new_v4();
        tracker.heartbeat(doc, "a@example.com").await;
        tracker.leave(doc, "a@example.com").await;
        tracker.leave(doc, "ghost@example.com").await;

        assert!(tracker.online(doc).await.is_empty());
        let entries = tracker.entries(doc).await;
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].online);
    }

    #[tokio::test]
    async fn test_sweep_expires_idle() {
        let tracker = PresenceTracker::new(Duration::from_secs(30));
        let doc = Uuid::new_v4();
        tracker.heartbeat(doc, "a@example.com").await;

        assert!(tracker.sweep_at(Instant::now()).await.is_empty());

        let later = Instant::now() + Duration::from_secs(31);
        let expired = tracker.sweep_at(later).await;
        assert_eq!(expired, vec![(doc, "a@example.com".to_string())]);
        assert!(tracker.online(doc).await.is_empty());
        // Nothing online left: the document is forgotten.
        assert!(tracker.entries(doc).await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_revives() {
        let tracker = PresenceTracker::new(Duration::from_millis(10));
        let doc = Uuid::new_v4();
        tracker.heartbeat(doc, "a@example.com").await;
        tracker.sweep_at(Instant::now() + Duration::from_secs(1)).await;
        tracker.heartbeat(doc, "a@example.com").await;
        assert_eq!(tracker.online(doc).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_task() {
        let tracker = Arc::new(PresenceTracker::new(Duration::from_millis(20)));
        let doc = Uuid::new_v4();
        tracker.heartbeat(doc, "a@example.com").await;

        let handle = tracker.clone().spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(tracker.online(doc).await.is_empty());
    }
}
