//! Collaboration record and its parts.
//!
//! ```text
//! CollaborationRecord (one per document, CAS token = `version`)
//!   ├── collaborators   [Collaborator]   unique email, ≥1 admin once non-empty
//!   ├── comments        [Comment]        append-only, only `resolved` toggles
//!   ├── version_history [VersionEntry]   gapless 1, 2, 3, …
//!   ├── status          RecordStatus
//!   └── deadline        Option<u64>
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::CollabError;

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Collaborator role. Ordered: `Viewer < Editor < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "editor" => Ok(Role::Editor),
            "admin" => Ok(Role::Admin),
            other => Err(CollabError::Validation(format!("unknown role `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorStatus {
    Active,
    Invited,
}

/// Document review status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Draft,
    InReview,
    Approved,
    Rejected,
    Published,
    Archived,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Draft => "draft",
            RecordStatus::InReview => "in_review",
            RecordStatus::Approved => "approved",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Published => "published",
            RecordStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "draft" => Ok(RecordStatus::Draft),
            "in_review" => Ok(RecordStatus::InReview),
            "approved" => Ok(RecordStatus::Approved),
            "rejected" => Ok(RecordStatus::Rejected),
            "published" => Ok(RecordStatus::Published),
            "archived" => Ok(RecordStatus::Archived),
            other => Err(CollabError::Validation(format!("unknown status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    /// Lowercased, unique within a record
    pub email: String,
    pub role: Role,
    pub joined_at: u64,
    pub status: CollaboratorStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub author: String,
    pub content: String,
    /// Optional anchor inside the document (heading, page, …)
    pub section: Option<String>,
    pub created_at: u64,
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// 1-based, gapless
    pub version: u64,
    pub author: String,
    pub changes_description: String,
    pub created_at: u64,
    pub size_bytes: u64,
}

/// The shared per-document collaboration state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationRecord {
    pub document_id: Uuid,
    pub collaborators: Vec<Collaborator>,
    pub comments: Vec<Comment>,
    pub version_history: Vec<VersionEntry>,
    pub status: RecordStatus,
    /// Deadline in epoch milliseconds
    pub deadline: Option<u64>,
    /// CAS token, bumped by every committed mutation
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl CollaborationRecord {
    /// New record with `owner` as its first (active) admin.
    pub fn new(document_id: Uuid, owner: &str, now: u64) -> Self {
        Self {
            document_id,
            collaborators: vec![Collaborator {
                email: owner.to_ascii_lowercase(),
                role: Role::Admin,
                joined_at: now,
                status: CollaboratorStatus::Active,
            }],
            comments: Vec::new(),
            version_history: Vec::new(),
            status: RecordStatus::Draft,
            deadline: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn collaborator(&self, email: &str) -> Option<&Collaborator> {
        self.collaborators
            .iter()
            .find(|c| c.email.eq_ignore_ascii_case(email))
    }

    pub fn collaborator_mut(&mut self, email: &str) -> Option<&mut Collaborator> {
        self.collaborators
            .iter_mut()
            .find(|c| c.email.eq_ignore_ascii_case(email))
    }

    pub fn role_of(&self, email: &str) -> Option<Role> {
        self.collaborator(email).map(|c| c.role)
    }

    pub fn admin_count(&self) -> usize {
        self.collaborators
            .iter()
            .filter(|c| c.role == Role::Admin)
            .count()
    }

    pub fn comment(&self, id: Uuid) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == id)
    }

    /// Highest version number in the history, 0 when empty.
    pub fn latest_version_number(&self) -> u64 {
        self.version_history.last().map_or(0, |v| v.version)
    }

    /// Stamp a committed mutation: bump the CAS token and `updated_at`.
    pub(crate) fn touch(&mut self, now: u64) {
        self.version += 1;
        self.updated_at = now;
    }
}

/// Who performed an operation.
///
/// Identity is authenticated upstream; the core only trusts what it is given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    User(String),
    /// A workflow rule acting on behalf of the admin who authored it.
    Workflow(Uuid),
}

impl Actor {
    pub fn user(email: impl Into<String>) -> Self {
        Actor::User(email.into().trim().to_ascii_lowercase())
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            Actor::User(email) => Some(email),
            Actor::Workflow(_) => None,
        }
    }

    pub fn is_workflow(&self) -> bool {
        matches!(self, Actor::Workflow(_))
    }

    /// Label written to the audit log.
    pub fn label(&self) -> String {
        match self {
            Actor::User(email) => email.clone(),
            Actor::Workflow(rule_id) => format!("workflow:{rule_id}"),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Normalize and validate an email address.
pub fn validate_email(email: &str) -> Result<String, CollabError> {
    let email = email.trim().to_ascii_lowercase();
    let invalid = || CollabError::Validation(format!("malformed email `{email}`"));

    if email.is_empty() || email.len() > 254 || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
    {
        return Err(invalid());
    }
    Ok(email)
}
