//! Service configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::presence::DEFAULT_PRESENCE_TIMEOUT;
use crate::retry::RetryPolicy;
use crate::storage::StoreConfig;
use crate::store::DEFAULT_MAX_COMMENT_LEN;
use crate::workflow::DEFAULT_ACTION_TIMEOUT;

#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Events buffered per subscriber before it starts skipping
    pub broadcast_capacity: usize,
    /// Retry policy for workflow-driven overwrites
    pub retry: RetryPolicy,
    /// Idle time before a user is shown offline
    pub presence_timeout: Duration,
    pub presence_sweep_interval: Duration,
    /// Upper bound for a single workflow action
    pub action_timeout: Duration,
    pub max_comment_len: usize,
    /// Emails allowed to manage global workflow rules
    pub global_admins: Vec<String>,
    /// RocksDB settings (None = in-memory only)
    pub storage: Option<StoreConfig>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            retry: RetryPolicy::default(),
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            presence_sweep_interval: Duration::from_secs(5),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            max_comment_len: DEFAULT_MAX_COMMENT_LEN,
            global_admins: Vec::new(),
            storage: None,
        }
    }
}

impl CollabConfig {
    /// In-memory config with short timers.
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 64,
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            presence_timeout: Duration::from_millis(200),
            presence_sweep_interval: Duration::from_millis(50),
            action_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Persist records and the audit ledger in RocksDB at `path`.
    pub fn with_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = Some(StoreConfig {
            path: path.into(),
            ..self.storage.unwrap_or_default()
        });
        self
    }

    pub fn with_global_admin(mut self, email: impl Into<String>) -> Self {
        self.global_admins.push(email.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.presence_timeout, Duration::from_secs(30));
        assert_eq!(config.action_timeout, Duration::from_secs(10));
        assert!(config.storage.is_none());
    }

    #[test]
    fn test_with_storage_keeps_tuning() {
        let config = CollabConfig::for_testing()
            .with_storage("/tmp/quire-test")
            .with_global_admin("root@example.com");
        let storage = config.storage.unwrap();
        assert_eq!(storage.path, PathBuf::from("/tmp/quire-test"));
        assert_eq!(storage.bloom_filter_bits, StoreConfig::default().bloom_filter_bits);
        assert_eq!(config.global_admins, vec!["root@example.com".to_string()]);
    }
}
