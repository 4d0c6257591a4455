//! Workflow rules: a trigger matched against audit events and an ordered
//! list of actions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent};
use crate::error::CollabError;
use crate::model::{now_millis, validate_email, RecordStatus, Role};

/// Which documents a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "document_id", rename_all = "snake_case")]
pub enum RuleScope {
    Global,
    Document(Uuid),
}

impl RuleScope {
    pub fn covers(&self, document_id: Uuid) -> bool {
        match self {
            RuleScope::Global => true,
            RuleScope::Document(id) => *id == document_id,
        }
    }
}

/// What a rule reacts to. Each variant carries its own filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// A comment was posted, optionally only on `section`.
    CommentAdded { section: Option<String> },
    /// Someone was invited, optionally only with `role`.
    UserAdded { role: Option<Role> },
    StatusChange {
        from: Option<RecordStatus>,
        to: Option<RecordStatus>,
    },
    /// Status moved to `in_review`.
    ApprovalNeeded,
    /// A deadline was set that falls within `within_ms` of the change.
    DeadlineApproaching { within_ms: u64 },
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::CommentAdded { .. } => "comment_added",
            Trigger::UserAdded { .. } => "user_added",
            Trigger::StatusChange { .. } => "status_change",
            Trigger::ApprovalNeeded => "approval_needed",
            Trigger::DeadlineApproaching { .. } => "deadline_approaching",
        }
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        match self {
            Trigger::CommentAdded { section } => {
                event.action == AuditAction::Comment
                    && section
                        .as_deref()
                        .is_none_or(|s| event.meta("section").is_some_and(|m| m.eq_ignore_ascii_case(s)))
            }
            Trigger::UserAdded { role } => {
                event.action == AuditAction::Invite
                    && role.is_none_or(|r| event.meta("role") == Some(r.as_str()))
            }
            Trigger::StatusChange { from, to } => {
                is_status_edit(event)
                    && from.is_none_or(|s| event.meta("from") == Some(s.as_str()))
                    && to.is_none_or(|s| event.meta("to") == Some(s.as_str()))
            }
            Trigger::ApprovalNeeded => {
                is_status_edit(event) && event.meta("to") == Some(RecordStatus::InReview.as_str())
            }
            Trigger::DeadlineApproaching { within_ms } => {
                event.action == AuditAction::Edit
                    && event.target == "deadline"
                    && event
                        .meta("deadline_at")
                        .and_then(|d| d.parse::<u64>().ok())
                        .is_some_and(|at| {
                            at >= event.timestamp && at - event.timestamp <= *within_ms
                        })
            }
        }
    }
}

fn is_status_edit(event: &AuditEvent) -> bool {
    event.action == AuditAction::Edit && event.target == "status"
}

/// One step of a rule. Interpreted by the engine, never evaluated as code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    SendEmail {
        to: String,
        subject: String,
        body: String,
    },
    /// `to: None` notifies every collaborator except whoever triggered it.
    SendNotification { to: Option<String>, message: String },
    AssignUser { email: String, role: Role },
    ChangeStatus { status: RecordStatus },
    CreateTask {
        title: String,
        assignee: Option<String>,
    },
}

impl WorkflowAction {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowAction::SendEmail { .. } => "send_email",
            WorkflowAction::SendNotification { .. } => "send_notification",
            WorkflowAction::AssignUser { .. } => "assign_user",
            WorkflowAction::ChangeStatus { .. } => "change_status",
            WorkflowAction::CreateTask { .. } => "create_task",
        }
    }

    fn validate(&self) -> Result<(), CollabError> {
        match self {
            WorkflowAction::SendEmail { to, subject, .. } => {
                validate_email(to)?;
                if subject.trim().is_empty() {
                    return Err(CollabError::Validation("email subject is empty".into()));
                }
            }
            WorkflowAction::SendNotification { to, message } => {
                if let Some(to) = to {
                    validate_email(to)?;
                }
                if message.trim().is_empty() {
                    return Err(CollabError::Validation("notification message is empty".into()));
                }
            }
            WorkflowAction::AssignUser { email, .. } => {
                validate_email(email)?;
            }
            WorkflowAction::ChangeStatus { .. } => {}
            WorkflowAction::CreateTask { title, assignee } => {
                if title.trim().is_empty() {
                    return Err(CollabError::Validation("task title is empty".into()));
                }
                if let Some(assignee) = assignee {
                    validate_email(assignee)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRule {
    pub id: Uuid,
    pub name: String,
    pub scope: RuleScope,
    pub trigger: Trigger,
    pub actions: Vec<WorkflowAction>,
    pub enabled: bool,
    /// Set by the engine from the authoring actor
    pub created_by: String,
    pub created_at: u64,
}

impl WorkflowRule {
    /// A new, enabled rule.
    pub fn new(
        name: impl Into<String>,
        scope: RuleScope,
        trigger: Trigger,
        actions: Vec<WorkflowAction>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            scope,
            trigger,
            actions,
            enabled: true,
            created_by: String::new(),
            created_at: now_millis(),
        }
    }

    pub fn validate(&self) -> Result<(), CollabError> {
        if self.name.trim().is_empty() {
            return Err(CollabError::Validation("rule name is empty".into()));
        }
        if self.actions.is_empty() {
            return Err(CollabError::Validation(format!("rule `{}` has no actions", self.name)));
        }
        self.actions.iter().try_for_each(WorkflowAction::validate)
    }

    /// Whether this rule fires for `event`.
    ///
    /// Events written by workflows, and `workflow_run` entries, never match,
    /// so rules cannot trigger each other.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.enabled
            && event.action != AuditAction::WorkflowRun
            && !event.is_from_workflow()
            && self.scope.covers(event.document_id)
            && self.trigger.matches(event)
    }
}
