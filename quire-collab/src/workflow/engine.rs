//! Rule evaluation and action dispatch.
//!
//! ```text
//! AuditLog ──(unbounded feed)──► dispatcher task
//!                                   │ route by document id
//!                                   ▼
//!                                per-document worker (in event order)
//!                                   │ snapshot enabled rules matching the event
//!                                   ▼
//!                                for each rule, for each action (in order):
//!                                   timeout(action_timeout, execute(action))
//!                                   └─► audit `workflow_run` (outcome ok | failed)
//! ```
//!
//! A slow action only holds up its own document. Workers exit after
//! an idle period (default [`WORKER_IDLE`]) without events; the next event for that document starts a
//! fresh worker once the old one has finished.
//!
//! A run works from the snapshot taken when the event arrived: disabling or
//! deleting a rule affects later events only. Action failures never reach the
//! triggering caller; they are logged and audited, and the run moves on to the
//! next action.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::notify::{Notifier, TaskRequest, TaskSink};
use super::rule::{RuleScope, WorkflowAction, WorkflowRule};
use crate::audit::{AuditAction, AuditEvent};
use crate::error::{CollabError, WorkflowActionError};
use crate::model::Actor;
use crate::permission::{Permission, PermissionModel};
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::store::CollaborationStore;

pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a per-document worker waits for its next event.
pub const WORKER_IDLE: Duration = Duration::from_secs(30);

struct DocumentWorker {
    queue: mpsc::UnboundedSender<AuditEvent>,
    finished: oneshot::Receiver<()>,
}

impl DocumentWorker {
    fn is_finished(&mut self) -> bool {
        !matches!(self.finished.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}

/// Result of one action within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub rule_id: Uuid,
    pub step: usize,
    pub action: &'static str,
    pub result: Result<(), WorkflowActionError>,
}

pub struct WorkflowEngine {
    store: Arc<CollaborationStore>,
    notifier: Arc<dyn Notifier>,
    tasks: Arc<dyn TaskSink>,
    rules: RwLock<HashMap<Uuid, WorkflowRule>>,
    action_timeout: Duration,
    worker_idle: Duration,
    retry: RetryPolicy,
    /// Who may manage global rules
    global_admins: HashSet<String>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<CollaborationStore>,
        notifier: Arc<dyn Notifier>,
        tasks: Arc<dyn TaskSink>,
    ) -> Self {
        Self {
            store,
            notifier,
            tasks,
            rules: RwLock::new(HashMap::new()),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            worker_idle: WORKER_IDLE,
            retry: RetryPolicy::default(),
            global_admins: HashSet::new(),
        }
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_worker_idle(mut self, idle: Duration) -> Self {
        self.worker_idle = idle;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_global_admins<I, S>(mut self, admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.global_admins = admins
            .into_iter()
            .map(|a| a.as_ref().trim().to_ascii_lowercase())
            .collect();
        self
    }

    /// Consume the audit feed until every sender is gone.
    ///
    /// Events of one document are evaluated in feed order; documents run
    /// independently. Aborting the returned handle aborts every worker.
    pub fn spawn(self: Arc<Self>, mut feed: mpsc::UnboundedReceiver<AuditEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!("Workflow engine started");
            let mut running = JoinSet::new();
            let mut workers: HashMap<Uuid, DocumentWorker> = HashMap::new();

            while let Some(event) = feed.recv().await {
                while running.try_join_next().is_some() {}
                workers.retain(|_, worker| !worker.is_finished());

                let document_id = event.document_id;
                let event = match workers.get(&document_id) {
                    Some(worker) => match worker.queue.send(event) {
                        Ok(()) => continue,
                        // Worker went idle; hand over to a fresh one.
                        Err(mpsc::error::SendError(event)) => event,
                    },
                    None => event,
                };

                let previous = workers.remove(&document_id).map(|w| w.finished);
                let (queue, inbox) = mpsc::unbounded_channel();
                let (done, finished) = oneshot::channel();
                if queue.send(event).is_err() {
                    continue;
                }
                running.spawn(self.clone().run_document(document_id, inbox, previous, done));
                workers.insert(document_id, DocumentWorker { queue, finished });
            }

            drop(workers);
            while running.join_next().await.is_some() {}
            log::info!("Workflow engine stopped: audit feed closed");
        })
    }

    async fn run_document(
        self: Arc<Self>,
        document_id: Uuid,
        mut inbox: mpsc::UnboundedReceiver<AuditEvent>,
        previous: Option<oneshot::Receiver<()>>,
        done: oneshot::Sender<()>,
    ) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        loop {
            match tokio::time::timeout(self.worker_idle, inbox.recv()).await {
                Ok(Some(event)) => {
                    self.evaluate(&event).await;
                }
                Ok(None) => break,
                Err(_) => {
                    inbox.close();
                    while let Ok(event) = inbox.try_recv() {
                        self.evaluate(&event).await;
                    }
                    log::debug!("Workflow worker for {document_id} idle, exiting");
                    break;
                }
            }
        }
        let _ = done.send(());
    }

    /// Run every enabled rule matching `event` to completion.
    pub async fn evaluate(&self, event: &AuditEvent) -> Vec<ActionOutcome> {
        let matching = self.matching_rules(event);
        let mut outcomes = Vec::new();
        for rule in &matching {
            log::debug!(
                "Rule `{}` ({}) triggered by {} on {}",
                rule.name,
                rule.trigger.name(),
                event.action,
                event.document_id
            );
            outcomes.extend(self.run_rule(rule, event).await);
        }
        outcomes
    }

    /// Snapshot of enabled rules that match, oldest first.
    pub fn matching_rules(&self, event: &AuditEvent) -> Vec<WorkflowRule> {
        let mut rules: Vec<WorkflowRule> = self
            .read_rules()
            .values()
            .filter(|r| r.matches(event))
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.created_at, r.id));
        rules
    }

    async fn run_rule(&self, rule: &WorkflowRule, event: &AuditEvent) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(rule.actions.len());
        for (step, action) in rule.actions.iter().enumerate() {
            let result = match tokio::time::timeout(
                self.action_timeout,
                self.execute(rule, action, event),
            )
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(reason),
                Err(_) => Err(format!("timed out after {:?}", self.action_timeout)),
            }
            .map_err(|reason| WorkflowActionError {
                rule_id: rule.id,
                action: action.kind(),
                reason,
            });

            if let Err(e) = &result {
                log::warn!("{e}");
            }
            self.audit_run(rule, step, action, event, &result);
            outcomes.push(ActionOutcome {
                rule_id: rule.id,
                step,
                action: action.kind(),
                result,
            });
        }
        outcomes
    }

    fn audit_run(
        &self,
        rule: &WorkflowRule,
        step: usize,
        action: &WorkflowAction,
        trigger: &AuditEvent,
        result: &Result<(), WorkflowActionError>,
    ) {
        let mut event = AuditEvent::new(
            trigger.document_id,
            &Actor::Workflow(rule.id),
            AuditAction::WorkflowRun,
            action.kind(),
        )
        .with_meta("rule_id", rule.id)
        .with_meta("rule", &rule.name)
        .with_meta("step", step)
        .with_meta("trigger_event", trigger.id);
        event = match result {
            Ok(()) => event.with_meta("outcome", "ok"),
            Err(e) => event.with_meta("outcome", "failed").with_meta("error", &e.reason),
        };
        if let Err(e) = self.store.audit().append(event) {
            log::error!("Could not audit workflow run of rule {}: {e}", rule.id);
        }
    }

    async fn execute(
        &self,
        rule: &WorkflowRule,
        action: &WorkflowAction,
        event: &AuditEvent,
    ) -> Result<(), String> {
        let doc = event.document_id;
        let actor = Actor::Workflow(rule.id);

        match action {
            WorkflowAction::SendEmail { to, subject, body } => self
                .notifier
                .send(to, &render(subject, rule, event), &render(body, rule, event))
                .await
                .map_err(|e| e.to_string()),

            WorkflowAction::SendNotification { to, message } => {
                let recipients = match to {
                    Some(to) => vec![to.clone()],
                    None => self
                        .store
                        .get(doc)
                        .map_err(|e| e.to_string())?
                        .collaborators
                        .into_iter()
                        .map(|c| c.email)
                        .filter(|email| *email != event.actor)
                        .collect(),
                };
                let body = render(message, rule, event);
                let mut failures = Vec::new();
                for recipient in &recipients {
                    if let Err(e) = self.notifier.send(recipient, &rule.name, &body).await {
                        failures.push(format!("{recipient}: {e}"));
                    }
                }
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(format!(
                        "{} of {} deliveries failed: {}",
                        failures.len(),
                        recipients.len(),
                        failures.join("; ")
                    ))
                }
            }

            WorkflowAction::AssignUser { email, role } => {
                let record = self.store.get(doc).map_err(|e| e.to_string())?;
                match record.role_of(email) {
                    Some(current) if current == *role => Ok(()),
                    Some(_) => retry_on_conflict(&self.retry, record, |r| {
                        self.store.change_role(doc, &actor, email, *role, r.version)
                    })
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                    None => self
                        .store
                        .add_collaborator(doc, &actor, email, *role)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                }
            }

            WorkflowAction::ChangeStatus { status } => {
                let record = self.store.get(doc).map_err(|e| e.to_string())?;
                if record.status == *status {
                    return Ok(());
                }
                retry_on_conflict(&self.retry, record, |r| {
                    self.store.change_status(doc, &actor, *status, r.version)
                })
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
            }

            WorkflowAction::CreateTask { title, assignee } => {
                let task = TaskRequest {
                    document_id: doc,
                    title: render(title, rule, event),
                    assignee: assignee.clone(),
                    created_by: actor.label(),
                };
                self.tasks
                    .create_task(task)
                    .await
                    .map(|id| log::debug!("Rule {} created task {id}", rule.id))
                    .map_err(|e| e.to_string())
            }
        }
    }

    // ─── Rule management ──────────────────────────────────────────────

    pub fn create_rule(&self, actor: &Actor, mut rule: WorkflowRule) -> Result<WorkflowRule, CollabError> {
        self.authorize_scope(actor, &rule.scope)?;
        rule.validate()?;
        rule.created_by = actor.label();

        let mut rules = self.write_rules();
        if rules.contains_key(&rule.id) {
            return Err(CollabError::Validation(format!("rule {} already exists", rule.id)));
        }
        rules.insert(rule.id, rule.clone());
        log::info!("Rule `{}` ({}) created by {actor}", rule.name, rule.id);
        Ok(rule)
    }

    /// Replace a rule's definition. Id, author and creation time are kept.
    pub fn update_rule(&self, actor: &Actor, mut rule: WorkflowRule) -> Result<WorkflowRule, CollabError> {
        let existing = self.require_rule(rule.id)?;
        self.authorize_scope(actor, &existing.scope)?;
        if rule.scope != existing.scope {
            self.authorize_scope(actor, &rule.scope)?;
        }
        rule.validate()?;
        rule.created_by = existing.created_by;
        rule.created_at = existing.created_at;

        self.write_rules().insert(rule.id, rule.clone());
        log::info!("Rule `{}` ({}) updated by {actor}", rule.name, rule.id);
        Ok(rule)
    }

    /// Enable or disable a rule. Runs already in flight are not affected.
    pub fn set_enabled(&self, actor: &Actor, rule_id: Uuid, enabled: bool) -> Result<WorkflowRule, CollabError> {
        let existing = self.require_rule(rule_id)?;
        self.authorize_scope(actor, &existing.scope)?;

        let mut rules = self.write_rules();
        let rule = rules
            .get_mut(&rule_id)
            .ok_or_else(|| CollabError::NotFound(format!("workflow rule {rule_id}")))?;
        rule.enabled = enabled;
        log::info!(
            "Rule {rule_id} {} by {actor}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(rule.clone())
    }

    pub fn delete_rule(&self, actor: &Actor, rule_id: Uuid) -> Result<(), CollabError> {
        let existing = self.require_rule(rule_id)?;
        self.authorize_scope(actor, &existing.scope)?;
        self.write_rules().remove(&rule_id);
        log::info!("Rule {rule_id} deleted by {actor}");
        Ok(())
    }

    pub fn rule(&self, rule_id: Uuid) -> Option<WorkflowRule> {
        self.read_rules().get(&rule_id).cloned()
    }

    /// All rules, oldest first.
    pub fn rules(&self) -> Vec<WorkflowRule> {
        let mut rules: Vec<WorkflowRule> = self.read_rules().values().cloned().collect();
        rules.sort_by_key(|r| (r.created_at, r.id));
        rules
    }

    /// Rules that watch `document_id`, global ones included.
    pub fn rules_for(&self, document_id: Uuid) -> Vec<WorkflowRule> {
        let mut rules = self.rules();
        rules.retain(|r| r.scope.covers(document_id));
        rules
    }

    fn require_rule(&self, rule_id: Uuid) -> Result<WorkflowRule, CollabError> {
        self.rule(rule_id)
            .ok_or_else(|| CollabError::NotFound(format!("workflow rule {rule_id}")))
    }

    fn authorize_scope(&self, actor: &Actor, scope: &RuleScope) -> Result<(), CollabError> {
        let denied = || CollabError::PermissionDenied {
            actor: actor.label(),
            action: Permission::ManageWorkflows.to_string(),
        };
        let email = actor.email().ok_or_else(denied)?;
        match scope {
            RuleScope::Global if self.global_admins.contains(email) => Ok(()),
            RuleScope::Global => Err(denied()),
            RuleScope::Document(document_id) => {
                let record = self.store.get(*document_id)?;
                PermissionModel::authorize(actor, Permission::ManageWorkflows, &record).map(|_| ())
            }
        }
    }

    fn read_rules(&self) -> RwLockReadGuard<'_, HashMap<Uuid, WorkflowRule>> {
        self.rules.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_rules(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, WorkflowRule>> {
        self.rules.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Expand `{document}`, `{actor}`, `{target}` and `{rule}` placeholders.
fn render(template: &str, rule: &WorkflowRule, event: &AuditEvent) -> String {
    template
        .replace("{document}", &event.document_id.to_string())
        .replace("{actor}", &event.actor)
        .replace("{target}", &event.target)
        .replace("{rule}", &rule.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFilter, AuditLog};
    use crate::broadcast::EventBus;
    use crate::model::{RecordStatus, Role};
    use crate::storage::MemoryBackend;
    use crate::workflow::notify::{MemoryTaskSink, RecordingNotifier};
    use crate::workflow::rule::Trigger;

    const OWNER: &str = "owner@example.com";

    struct Fixture {
        store: Arc<CollaborationStore>,
        notifier: Arc<RecordingNotifier>,
        tasks: Arc<MemoryTaskSink>,
        engine: WorkflowEngine,
        doc: Uuid,
    }

    async fn fixture(notifier: RecordingNotifier) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let audit = Arc::new(AuditLog::new(backend.clone()));
        let store = Arc::new(CollaborationStore::new(backend, audit, Arc::new(EventBus::new(16))));
        let notifier = Arc::new(notifier);
        let tasks = Arc::new(MemoryTaskSink::new());
        let engine = WorkflowEngine::new(store.clone(), notifier.clone(), tasks.clone())
            .with_action_timeout(Duration::from_millis(50))
            .with_global_admins(["Root@example.com"]);
        let doc = Uuid::new_v4();
        store.create(doc, OWNER).await.unwrap();
        Fixture {
            store,
            notifier,
            tasks,
            engine,
            doc,
        }
    }

    fn owner() -> Actor {
        Actor::user(OWNER)
    }

    fn runs(f: &Fixture) -> Vec<AuditEvent> {
        f.store
            .audit()
            .query(f.doc, &AuditFilter::default().action(AuditAction::WorkflowRun))
            .unwrap()
    }

    #[tokio::test]
    async fn test_rule_management_authorization() {
        let f = fixture(RecordingNotifier::new()).await;
        f.store.add_collaborator(f.doc, &owner(), "ed@example.com", Role::Editor).await.unwrap();

        let rule = WorkflowRule::new(
            "r",
            RuleScope::Document(f.doc),
            Trigger::ApprovalNeeded,
            vec![WorkflowAction::ChangeStatus {
                status: RecordStatus::Approved,
            }],
        );
        assert!(matches!(
            f.engine.create_rule(&Actor::user("ed@example.com"), rule.clone()),
            Err(CollabError::PermissionDenied { .. })
        ));
        let created = f.engine.create_rule(&owner(), rule).unwrap();
        assert_eq!(created.created_by, OWNER);

        let global = WorkflowRule::new("g", RuleScope::Global, Trigger::ApprovalNeeded, created.actions.clone());
        assert!(f.engine.create_rule(&owner(), global.clone()).is_err());
        assert!(f.engine.create_rule(&Actor::user("root@example.com"), global).is_ok());
        assert!(f.engine.create_rule(&Actor::Workflow(created.id), created.clone()).is_err());

        assert_eq!(f.engine.rules_for(f.doc).len(), 2);
        assert_eq!(f.engine.rules_for(Uuid::new_v4()).len(), 1);

        let disabled = f.engine.set_enabled(&owner(), created.id, false).unwrap();
        assert!(!disabled.enabled);
        f.engine.delete_rule(&owner(), created.id).unwrap();
        assert!(f.engine.rule(created.id).is_none());
        assert!(matches!(f.engine.delete_rule(&owner(), created.id), Err(CollabError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_keeps_identity() {
        let f = fixture(RecordingNotifier::new()).await;
        let rule = f
            .engine
            .create_rule(
                &owner(),
                WorkflowRule::new(
                    "before",
                    RuleScope::Document(f.doc),
                    Trigger::ApprovalNeeded,
                    vec![WorkflowAction::ChangeStatus {
                        status: RecordStatus::Approved,
                    }],
                ),
            )
            .unwrap();

        let mut changed = rule.clone();
        changed.name = "after".into();
        changed.created_by = "someone@else.com".into();
        let updated = f.engine.update_rule(&owner(), changed).unwrap();
        assert_eq!(updated.name, "after");
        assert_eq!(updated.created_by, OWNER);
        assert_eq!(updated.created_at, rule.created_at);
    }

    #[tokio::test]
    async fn test_actions_run_in_order_and_are_audited() {
        let f = fixture(RecordingNotifier::new()).await;
        f.engine
            .create_rule(
                &owner(),
                WorkflowRule::new(
                    "review",
                    RuleScope::Document(f.doc),
                    Trigger::ApprovalNeeded,
                    vec![
                        WorkflowAction::AssignUser {
                            email: "reviewer@example.com".into(),
                            role: Role::Editor,
                        },
                        WorkflowAction::CreateTask {
                            title: "Review {document}".into(),
                            assignee: Some("reviewer@example.com".into()),
                        },
                        WorkflowAction::SendEmail {
                            to: "reviewer@example.com".into(),
                            subject: "Please review".into(),
                            body: "{actor} asked for a review".into(),
                        },
                    ],
                ),
            )
            .unwrap();

        let v = f.store.get(f.doc).unwrap().version;
        f.store.change_status(f.doc, &owner(), RecordStatus::InReview, v).await.unwrap();
        let trigger = f
            .store
            .audit()
            .query(f.doc, &AuditFilter::default().action(AuditAction::Edit))
            .unwrap()
            .pop()
            .unwrap();

        let outcomes = f.engine.evaluate(&trigger).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        let record = f.store.get(f.doc).unwrap();
        assert_eq!(record.role_of("reviewer@example.com"), Some(Role::Editor));
        let tasks = f.tasks.tasks();
        assert_eq!(tasks[0].1.title, format!("Review {}", f.doc));
        assert_eq!(f.notifier.sent_to("reviewer@example.com")[0].body, format!("{OWNER} asked for a review"));

        let steps: Vec<String> = runs(&f).iter().map(|e| e.target.clone()).collect();
        assert_eq!(steps, vec!["assign_user", "create_task", "send_email"]);
        assert!(runs(&f).iter().all(|e| e.meta("outcome") == Some("ok")));

        // The invite written by the rule does not re-trigger anything.
        let invite = f
            .store
            .audit()
            .query(f.doc, &AuditFilter::default().action(AuditAction::Invite))
            .unwrap()
            .pop()
            .unwrap();
        assert!(invite.is_from_workflow());
        assert!(f.engine.evaluate(&invite).await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_and_timeout_do_not_stop_run() {
        let f = fixture(RecordingNotifier::new().with_delay(Duration::from_millis(200))).await;
        f.engine
            .create_rule(
                &owner(),
                WorkflowRule::new(
                    "slow",
                    RuleScope::Document(f.doc),
                    Trigger::CommentAdded { section: None },
                    vec![
                        WorkflowAction::SendEmail {
                            to: "x@example.com".into(),
                            subject: "s".into(),
                            body: "b".into(),
                        },
                        WorkflowAction::AssignUser {
                            email: OWNER.into(),
                            role: Role::Viewer,
                        },
                        WorkflowAction::CreateTask {
                            title: "follow up".into(),
                            assignee: None,
                        },
                    ],
                ),
            )
            .unwrap();

        f.store.append_comment(f.doc, &owner(), "hi", None).await.unwrap();
        let trigger = f
            .store
            .audit()
            .query(f.doc, &AuditFilter::default().action(AuditAction::Comment))
            .unwrap()
            .pop()
            .unwrap();

        let outcomes = f.engine.evaluate(&trigger).await;
        assert_eq!(outcomes.len(), 3);
        // Slow notifier times out; demoting the only admin is refused.
        assert!(outcomes[0].result.as_ref().unwrap_err().reason.contains("timed out"));
        assert!(outcomes[1].result.is_err());
        assert!(outcomes[2].result.is_ok());
        assert_eq!(f.store.get(f.doc).unwrap().role_of(OWNER), Some(Role::Admin));

        let runs = runs(&f);
        let outcomes: Vec<&str> = runs.iter().filter_map(|e| e.meta("outcome")).collect();
        assert_eq!(outcomes, vec!["failed", "failed", "ok"]);
    }

    #[tokio::test]
    async fn test_notification_fans_out_to_collaborators() {
        let f = fixture(RecordingNotifier::new()).await;
        f.store.add_collaborator(f.doc, &owner(), "b@example.com", Role::Editor).await.unwrap();
        f.store.add_collaborator(f.doc, &owner(), "c@example.com", Role::Viewer).await.unwrap();
        f.engine
            .create_rule(
                &owner(),
                WorkflowRule::new(
                    "comments",
                    RuleScope::Document(f.doc),
                    Trigger::CommentAdded { section: None },
                    vec![WorkflowAction::SendNotification {
                        to: None,
                        message: "new comment on {document}".into(),
                    }],
                ),
            )
            .unwrap();

        let bob = Actor::user("b@example.com");
        f.store.append_comment(f.doc, &bob, "hello", None).await.unwrap();
        let trigger = f
            .store
            .audit()
            .query(f.doc, &AuditFilter::default().action(AuditAction::Comment))
            .unwrap()
            .pop()
            .unwrap();
        f.engine.evaluate(&trigger).await;

        let mut recipients: Vec<String> = f.notifier.sent().into_iter().map(|n| n.to).collect();
        recipients.sort();
        assert_eq!(recipients, vec!["c@example.com".to_string(), OWNER.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_skip_the_rest() {
        let notifier = RecordingNotifier::new();
        notifier.fail_for(OWNER);
        let f = fixture(notifier).await;
        f.store.add_collaborator(f.doc, &owner(), "b@example.com", Role::Editor).await.unwrap();
        f.store.add_collaborator(f.doc, &owner(), "c@example.com", Role::Viewer).await.unwrap();
        f.engine
            .create_rule(
                &owner(),
                WorkflowRule::new(
                    "comments",
                    RuleScope::Document(f.doc),
                    Trigger::CommentAdded { section: None },
                    vec![WorkflowAction::SendNotification {
                        to: None,
                        message: "new comment".into(),
                    }],
                ),
            )
            .unwrap();

        f.store.append_comment(f.doc, &Actor::user("b@example.com"), "hello", None).await.unwrap();
        let trigger = f
            .store
            .audit()
            .query(f.doc, &AuditFilter::default().action(AuditAction::Comment))
            .unwrap()
            .pop()
            .unwrap();
        let outcomes = f.engine.evaluate(&trigger).await;

        // Owner is first in line and refused; c is still notified.
        let reason = &outcomes[0].result.as_ref().unwrap_err().reason;
        assert!(reason.starts_with("1 of 2 deliveries failed"));
        assert!(reason.contains(OWNER));
        let sent: Vec<String> = f.notifier.sent().into_iter().map(|n| n.to).collect();
        assert_eq!(sent, vec!["c@example.com".to_string()]);
    }

    /// Delays deliveries to one address.
    struct SlowFor {
        slow: &'static str,
        delay: Duration,
        inner: RecordingNotifier,
    }

    #[async_trait::async_trait]
    impl Notifier for SlowFor {
        async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), crate::error::ExternalServiceError> {
            if to == self.slow {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.send(to, subject, body).await
        }
    }

    fn email_on_comment(doc: Uuid, to: &str) -> WorkflowRule {
        WorkflowRule::new(
            format!("mail {to}"),
            RuleScope::Document(doc),
            Trigger::CommentAdded { section: None },
            vec![WorkflowAction::SendEmail {
                to: to.into(),
                subject: "comment".into(),
                body: "{actor}".into(),
            }],
        )
    }

    #[tokio::test]
    async fn test_slow_document_does_not_block_others() {
        let backend = Arc::new(MemoryBackend::new());
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let audit = Arc::new(AuditLog::new(backend.clone()).with_feed(feed_tx));
        let store = Arc::new(CollaborationStore::new(backend, audit, Arc::new(EventBus::new(16))));
        let notifier = Arc::new(SlowFor {
            slow: "slow@example.com",
            delay: Duration::from_secs(2),
            inner: RecordingNotifier::new(),
        });
        let engine = Arc::new(
            WorkflowEngine::new(store.clone(), notifier.clone(), Arc::new(MemoryTaskSink::new()))
                .with_action_timeout(Duration::from_secs(5)),
        );

        let (doc_a, doc_b) = (Uuid::new_v4(), Uuid::new_v4());
        store.create(doc_a, OWNER).await.unwrap();
        store.create(doc_b, OWNER).await.unwrap();
        engine.create_rule(&owner(), email_on_comment(doc_a, "slow@example.com")).unwrap();
        engine.create_rule(&owner(), email_on_comment(doc_b, "fast@example.com")).unwrap();
        let handle = engine.clone().spawn(feed_rx);

        store.append_comment(doc_a, &owner(), "first", None).await.unwrap();
        store.append_comment(doc_b, &owner(), "second", None).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while notifier.inner.sent_to("fast@example.com").is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(notifier.inner.sent_to("fast@example.com").len(), 1);
        assert!(notifier.inner.sent_to("slow@example.com").is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_idle_worker_hands_over() {
        let backend = Arc::new(MemoryBackend::new());
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let audit = Arc::new(AuditLog::new(backend.clone()).with_feed(feed_tx));
        let store = Arc::new(CollaborationStore::new(backend, audit, Arc::new(EventBus::new(16))));
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = Arc::new(
            WorkflowEngine::new(store.clone(), notifier.clone(), Arc::new(MemoryTaskSink::new()))
                .with_worker_idle(Duration::from_millis(20)),
        );
        let doc = Uuid::new_v4();
        store.create(doc, OWNER).await.unwrap();
        engine.create_rule(&owner(), email_on_comment(doc, "x@example.com")).unwrap();
        let handle = engine.clone().spawn(feed_rx);

        for round in 1..=3 {
            store.append_comment(doc, &owner(), "again", None).await.unwrap();
            // Long enough for the worker to go idle between rounds.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(notifier.sent().len(), round);
        }
        handle.abort();
    }
}
