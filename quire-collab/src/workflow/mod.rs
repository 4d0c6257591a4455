//! Rule-based automation driven by the audit feed.
//!
//! - [`rule`] — rules, triggers and the closed set of actions
//! - [`engine`] — evaluation loop, action interpreter, rule management
//! - [`notify`] — outbound notifier and task sink seams

pub mod engine;
pub mod notify;
pub mod rule;

pub use engine::{ActionOutcome, WorkflowEngine, DEFAULT_ACTION_TIMEOUT};
pub use notify::{MemoryTaskSink, Notification, Notifier, RecordingNotifier, TaskRequest, TaskSink};
pub use rule::{RuleScope, Trigger, WorkflowAction, WorkflowRule};
