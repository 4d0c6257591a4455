//! Role hierarchy and authorization checks.
//!
//! | Permission                 | viewer | editor | admin |
//! |----------------------------|:------:|:------:|:-----:|
//! | Read / View                |   ✓    |   ✓    |   ✓   |
//! | Comment, ResolveComment    |        |   ✓    |   ✓   |
//! | CreateVersion, Restore     |        |   ✓    |   ✓   |
//! | ChangeStatus, SetDeadline  |        |   ✓    |   ✓   |
//! | Share                      |        |   ✓    |   ✓   |
//! | ManageCollaborators, Roles |        |        |   ✓   |
//! | ManageWorkflows, Delete    |        |        |   ✓   |

use std::fmt;

use crate::error::CollabError;
use crate::model::{Actor, CollaborationRecord, Collaborator, Role};

/// An operation that needs authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Comment,
    ResolveComment,
    CreateVersion,
    RestoreVersion,
    ChangeStatus,
    SetDeadline,
    Share,
    ManageCollaborators,
    ChangeRole,
    ManageWorkflows,
    DeleteRecord,
}

impl Permission {
    /// Minimum role required.
    pub fn required_role(&self) -> Role {
        match self {
            Permission::Read => Role::Viewer,
            Permission::Comment
            | Permission::ResolveComment
            | Permission::CreateVersion
            | Permission::RestoreVersion
            | Permission::ChangeStatus
            | Permission::SetDeadline
            | Permission::Share => Role::Editor,
            Permission::ManageCollaborators
            | Permission::ChangeRole
            | Permission::ManageWorkflows
            | Permission::DeleteRecord => Role::Admin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Comment => "comment",
            Permission::ResolveComment => "resolve comments",
            Permission::CreateVersion => "create versions",
            Permission::RestoreVersion => "restore versions",
            Permission::ChangeStatus => "change status",
            Permission::SetDeadline => "set deadlines",
            Permission::Share => "share",
            Permission::ManageCollaborators => "manage collaborators",
            Permission::ChangeRole => "change roles",
            Permission::ManageWorkflows => "manage workflow rules",
            Permission::DeleteRecord => "delete the record",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless permission checks over a record.
pub struct PermissionModel;

impl PermissionModel {
    /// Whether `role` (None = not a collaborator) may perform `permission`.
    ///
    /// Invited collaborators hold their role from the moment they are invited;
    /// the record is taken for future per-record policy.
    pub fn can_perform(
        role: Option<Role>,
        permission: Permission,
        _record: &CollaborationRecord,
    ) -> bool {
        role.is_some_and(|r| r >= permission.required_role())
    }

    /// Resolve the actor's role and check it.
    ///
    /// Workflow actors are always allowed and resolve to `None`.
    pub fn authorize(
        actor: &Actor,
        permission: Permission,
        record: &CollaborationRecord,
    ) -> Result<Option<Role>, CollabError> {
        let email = match actor {
            Actor::Workflow(_) => return Ok(None),
            Actor::User(email) => email,
        };
        let role = record.role_of(email);
        if Self::can_perform(role, permission, record) {
            Ok(role)
        } else {
            Err(CollabError::PermissionDenied {
                actor: email.clone(),
                action: permission.to_string(),
            })
        }
    }

    /// Reject a mutation that takes `record` (the pre-mutation state) from
    /// having an admin to `post_mutation` having none, an empty set included.
    /// A record is emptied only by deleting it.
    pub fn ensure_admin_remains(
        record: &CollaborationRecord,
        post_mutation: &[Collaborator],
    ) -> Result<(), CollabError> {
        let is_admin = |c: &Collaborator| c.role == Role::Admin;
        if record.collaborators.iter().any(is_admin) && !post_mutation.iter().any(is_admin) {
            return Err(CollabError::LastAdmin(record.document_id));
        }
        Ok(())
    }
}
