//! Bounded retry for CAS-protected overwrites.
//!
//! ```text
//! attempt 1: op(record)        ──► Ok            → done
//!                              ──► VersionConflict{latest}
//! sleep(next jittered exponential delay)
//! attempt 2: op(latest)        ──► …
//! …
//! attempt N: conflict again    → EditConflict
//! ```
//!
//! Every attempt recomputes the mutation against the record the previous
//! conflict returned, so a retry never replays a stale decision.

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;

use crate::error::CollabError;
use crate::model::CollaborationRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3)
    pub max_attempts: u32,
    /// Backoff before the second attempt, doubled after each conflict,
    /// plus up to 100% jitter
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Single attempt: conflicts surface to the caller as `EditConflict`.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delays between attempts: one per retry, `max_attempts - 1` in total.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.base_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
            .build()
    }
}

/// Run `op` against `initial`, retrying on `VersionConflict` with the latest
/// record. Other errors are returned as is.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    initial: CollaborationRecord,
    mut op: F,
) -> Result<T, CollabError>
where
    F: FnMut(CollaborationRecord) -> Fut,
    Fut: Future<Output = Result<T, CollabError>>,
{
    let document_id = initial.document_id;
    let attempts = policy.max_attempts.max(1);
    let mut delays = policy.backoff();
    let mut record = initial;

    for attempt in 1..=attempts {
        match op(record).await {
            Err(CollabError::VersionConflict { latest }) => {
                log::debug!(
                    "Conflict on {document_id} (attempt {attempt}/{attempts}), latest version {}",
                    latest.version
                );
                record = *latest;
                match delays.next() {
                    Some(delay) if attempt < attempts => tokio::time::sleep(delay).await,
                    _ => break,
                }
            }
            other => return other,
        }
    }

    log::warn!("Giving up on {document_id} after {attempts} conflicting attempts");
    Err(CollabError::EditConflict {
        document_id,
        attempts,
    })
}
