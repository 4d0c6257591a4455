//! Outbound seams used by workflow actions.
//!
//! Delivery (SMTP, push, a task tracker) lives outside this crate. The engine
//! only sees these traits; the in-memory implementations back tests and
//! single-node setups that poll them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ExternalServiceError;
use crate::model::now_millis;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ExternalServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub document_id: Uuid,
    pub title: String,
    pub assignee: Option<String>,
    /// Audit label of the rule that created it
    pub created_by: String,
}

#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Create a task and return its id.
    async fn create_task(&self, task: TaskRequest) -> Result<Uuid, ExternalServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub sent_at: u64,
}

/// Keeps every notification it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    /// Recipients whose delivery fails
    failing: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait `delay` before each send (simulates a slow gateway).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make deliveries to `email` fail.
    pub fn fail_for(&self, email: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(email.to_ascii_lowercase());
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, email: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.to.eq_ignore_ascii_case(email))
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ExternalServiceError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let refused = self
            .failing
            .lock()
            .map(|f| f.contains(&to.to_ascii_lowercase()))
            .unwrap_or(false);
        if refused {
            return Err(ExternalServiceError::new("notifier", format!("delivery to {to} refused")));
        }

        let mut sent = self
            .sent
            .lock()
            .map_err(|_| ExternalServiceError::new("notifier", "outbox lock poisoned"))?;
        sent.push(Notification {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            sent_at: now_millis(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTaskSink {
    tasks: Mutex<Vec<(Uuid, TaskRequest)>>,
}

impl MemoryTaskSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<(Uuid, TaskRequest)> {
        self.tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TaskSink for MemoryTaskSink {
    async fn create_task(&self, task: TaskRequest) -> Result<Uuid, ExternalServiceError> {
        let id = Uuid::new_v4();
        self.tasks
            .lock()
            .map_err(|_| ExternalServiceError::new("tasks", "task list lock poisoned"))?
            .push((id, task));
        Ok(id)
    }
}
