//! Wires store, audit log, event bus, presence and workflows from one config.
//!
//! ```text
//!                    ┌───────────────────────── CollabService ─────────────────────────┐
//!  client action ──► │ CollaborationStore ──► AuditLog ──(feed)──► WorkflowEngine task │
//!                    │        │                                                        │
//!                    │        └──► EventBus ──► Subscription(s)                        │
//!  heartbeat     ──► │ PresenceTracker ◄── sweeper task                                │
//!                    └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::broadcast::{BusStats, EventBus, Subscription};
use crate::config::CollabConfig;
use crate::error::CollabError;
use crate::model::CollaborationRecord;
use crate::presence::PresenceTracker;
use crate::storage::{LedgerBackend, MemoryBackend, RocksBackend};
use crate::store::CollaborationStore;
use crate::workflow::{MemoryTaskSink, Notifier, RecordingNotifier, TaskSink, WorkflowEngine};

/// Service statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub documents: usize,
    pub rules: usize,
    pub bus: BusStats,
}

pub struct CollabService {
    config: CollabConfig,
    store: Arc<CollaborationStore>,
    presence: Arc<PresenceTracker>,
    workflows: Arc<WorkflowEngine>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CollabService {
    /// Build the service and start its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: CollabConfig,
        notifier: Arc<dyn Notifier>,
        task_sink: Arc<dyn TaskSink>,
    ) -> Result<Self, CollabError> {
        match &config.storage {
            Some(store_config) => {
                let backend = Arc::new(RocksBackend::open(store_config.clone())?);
                Ok(Self::wire(config, backend, notifier, task_sink))
            }
            None => Ok(Self::wire(config, Arc::new(MemoryBackend::new()), notifier, task_sink)),
        }
    }

    /// Service with in-memory notifier and task sink.
    pub fn with_defaults(config: CollabConfig) -> Result<Self, CollabError> {
        Self::new(
            config,
            Arc::new(RecordingNotifier::new()),
            Arc::new(MemoryTaskSink::new()),
        )
    }

    fn wire<B>(
        config: CollabConfig,
        backend: Arc<B>,
        notifier: Arc<dyn Notifier>,
        task_sink: Arc<dyn TaskSink>,
    ) -> Self
    where
        B: LedgerBackend + 'static,
    {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let audit = Arc::new(AuditLog::new(backend.clone()).with_feed(feed_tx));
        let bus = Arc::new(EventBus::new(config.broadcast_capacity));
        let store = Arc::new(
            CollaborationStore::new(backend, audit, bus).with_max_comment_len(config.max_comment_len),
        );

        let workflows = Arc::new(
            WorkflowEngine::new(store.clone(), notifier, task_sink)
                .with_action_timeout(config.action_timeout)
                .with_retry_policy(config.retry.clone())
                .with_global_admins(&config.global_admins),
        );
        let presence = Arc::new(PresenceTracker::new(config.presence_timeout));

        let tasks = vec![
            workflows.clone().spawn(feed_rx),
            presence.clone().spawn_sweeper(config.presence_sweep_interval),
        ];
        log::info!(
            "Collaboration service started ({} storage)",
            if config.storage.is_some() { "rocksdb" } else { "in-memory" }
        );

        Self {
            config,
            store,
            presence,
            workflows,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CollaborationStore> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        self.store.audit()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.store.bus()
    }

    /// Record for `document_id`, created with `owner` as admin on first use.
    pub async fn ensure_record(
        &self,
        document_id: Uuid,
        owner: &str,
    ) -> Result<CollaborationRecord, CollabError> {
        self.store.ensure_record(document_id, owner).await
    }

    pub fn subscribe(&self, document_id: Uuid) -> Subscription {
        self.store.subscribe(document_id)
    }

    pub fn stats(&self) -> Result<ServiceStats, CollabError> {
        Ok(ServiceStats {
            documents: self.store.list_documents()?.len(),
            rules: self.workflows.rules().len(),
            bus: self.bus().stats(),
        })
    }

    /// Stop the workflow and presence tasks. Queued workflow events are
    /// dropped.
    pub fn shutdown(&self) {
        for task in self.take_tasks() {
            task.abort();
        }
    }

    /// Like [`shutdown`](Self::shutdown), but waits until the tasks have
    /// released their handles on the store.
    pub async fn close(&self) {
        for task in self.take_tasks() {
            task.abort();
            let _ = task.await;
        }
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if !tasks.is_empty() {
            log::info!("Collaboration service shutting down");
        }
        tasks
    }
}

impl Drop for CollabService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
