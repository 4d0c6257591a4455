//! Per-document fan-out of record changes to live subscribers.
//!
//! Each document gets its own tokio broadcast channel, so ordering holds
//! within a document (the store publishes under its per-document commit
//! lock) and nothing is promised across documents. Delivery is at-most-once:
//! a subscriber that falls more than `capacity` events behind skips the
//! missed events.
//!
//! A [`Subscription`] unregisters itself when dropped or when
//! [`Subscription::unsubscribe`] is called, whichever comes first. Rooms with
//! no subscribers left are removed.

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::model::{Collaborator, Comment, RecordStatus, VersionEntry};

/// What changed in a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    /// Full collaborator list after an add, accept, role change or removal
    CollaboratorsChanged { collaborators: Vec<Collaborator> },
    CommentAdded { comment: Comment },
    CommentResolved { comment_id: Uuid, resolved: bool },
    VersionAdded { entry: VersionEntry },
    VersionRestored { version: u64 },
    StatusChanged { from: RecordStatus, to: RecordStatus },
    DeadlineChanged { deadline: Option<u64> },
    Deleted,
}

/// A committed change, as pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub document_id: Uuid,
    /// Record version after the change
    pub record_version: u64,
    pub actor: String,
    pub kind: ChangeKind,
}

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_rooms: usize,
    pub active_subscribers: usize,
}

#[derive(Default)]
struct AtomicBusStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// One document's channel and its registered subscribers.
struct Room {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
    subscribers: HashSet<Uuid>,
}

type Rooms = Arc<Mutex<HashMap<Uuid, Room>>>;

pub struct EventBus {
    rooms: Rooms,
    /// Events buffered per subscriber before it starts lagging
    capacity: usize,
    stats: Arc<AtomicBusStats>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBusStats::default()),
        }
    }

    /// Subscribe to a document's change stream.
    pub fn subscribe(&self, document_id: Uuid) -> Subscription {
        let id = Uuid::new_v4();
        let receiver = {
            let mut rooms = lock(&self.rooms);
            let room = rooms.entry(document_id).or_insert_with(|| Room {
                sender: broadcast::channel(self.capacity).0,
                subscribers: HashSet::new(),
            });
            room.subscribers.insert(id);
            room.sender.subscribe()
        };
        log::debug!("Subscriber {id} joined document {document_id}");

        Subscription {
            id,
            document_id,
            receiver: Some(receiver),
            rooms: self.rooms.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Fan an event out to the document's subscribers.
    ///
    /// Returns how many subscribers it was queued for (0 when nobody listens).
    pub fn publish(&self, document_id: Uuid, event: ChangeEvent) -> usize {
        let event = Arc::new(event);
        let count = lock(&self.rooms)
            .get(&document_id)
            .map_or(0, |room| room.sender.send(event).unwrap_or(0));
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Drop the document's room. Subscribers drain what is buffered and
    /// then see the end of the stream.
    pub fn close(&self, document_id: Uuid) -> bool {
        lock(&self.rooms).remove(&document_id).is_some()
    }

    pub fn subscriber_count(&self, document_id: Uuid) -> usize {
        lock(&self.rooms)
            .get(&document_id)
            .map_or(0, |room| room.subscribers.len())
    }

    pub fn room_count(&self) -> usize {
        lock(&self.rooms).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        let rooms = lock(&self.rooms);
        BusStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            active_subscribers: rooms.values().map(|r| r.subscribers.len()).sum(),
        }
    }
}

fn lock(rooms: &Rooms) -> std::sync::MutexGuard<'_, HashMap<Uuid, Room>> {
    // A panic while holding the lock leaves plain maps behind; keep serving.
    rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A live subscription to one document.
pub struct Subscription {
    id: Uuid,
    document_id: Uuid,
    receiver: Option<broadcast::Receiver<Arc<ChangeEvent>>>,
    rooms: Rooms,
    stats: Arc<AtomicBusStats>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Wait for the next event. `None` once unsubscribed or the room closed.
    pub async fn recv(&mut self) -> Option<Arc<ChangeEvent>> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Subscriber {} lagged by {n} events on {}", self.id, self.document_id);
                    self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<Arc<ChangeEvent>> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }

    /// Stop receiving and release the registration. Idempotent.
    pub fn unsubscribe(&mut self) {
        if self.receiver.take().is_none() {
            return;
        }
        let mut rooms = lock(&self.rooms);
        if let Some(room) = rooms.get_mut(&self.document_id) {
            room.subscribers.remove(&self.id);
            if room.subscribers.is_empty() {
                rooms.remove(&self.document_id);
            }
        }
        log::debug!("Subscriber {} left document {}", self.id, self.document_id);
    }

    /// Adapt into a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = Arc<ChangeEvent>> {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
