//! Status manager: idempotent, optimistically-concurrent status writes.
//!
//! Every mutation follows the same protocol:
//! 1. Read the current object and its version
//! 2. Decide on a fresh copy of the status (or decide nothing needs writing)
//! 3. Write conditionally on the version read in step 1
//! 4. On conflict, start over, up to the configured retry budget

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use courier_common::types::{
    AttemptOutcome, Condition, DeliveryAttempt, NotificationRequest, NotificationStatus, Phase,
};

use crate::clock::Clock;
use crate::retry::RetryPolicy;
use crate::store::{NotificationStore, StoreError, StoredNotification};

pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("notification {0} no longer exists")]
    Vanished(Uuid),

    #[error("status write for notification {id} conflicted {attempts} times")]
    Conflict { id: Uuid, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What `append_attempt` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Recorded,
    /// The channel (or the whole notification) was already terminal; nothing written.
    AlreadyTerminal,
    /// An attempt with the same number already exists; nothing written.
    Duplicate,
}

enum Change<T> {
    Write(NotificationStatus, T),
    Skip(T),
}

pub struct StatusManager {
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
    conflict_retries: u32,
}

impl StatusManager {
    pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>, conflict_retries: u32) -> Self {
        Self {
            store,
            clock,
            conflict_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Fresh read. A missing object is `Vanished`.
    pub async fn load(&self, id: Uuid) -> Result<StoredNotification, StatusError> {
        self.store
            .get(id)
            .await?
            .ok_or(StatusError::Vanished(id))
    }

    /// Append one attempt record, unless the channel is already terminal or
    /// the same attempt number was already recorded.
    pub async fn append_attempt(
        &self,
        id: Uuid,
        attempt: DeliveryAttempt,
    ) -> Result<AppendResult, StatusError> {
        self.modify(id, |request| {
            let status = &request.status;
            if status.phase.is_terminal() {
                return Change::Skip(AppendResult::AlreadyTerminal);
            }

            let mut previous = status.attempts_for(&attempt.channel).peekable();
            if previous.peek().is_some() {
                let previous: Vec<&DeliveryAttempt> = previous.collect();
                if previous.iter().any(|a| a.is_terminal()) {
                    return Change::Skip(AppendResult::AlreadyTerminal);
                }
                if previous.iter().any(|a| a.attempt == attempt.attempt) {
                    return Change::Skip(AppendResult::Duplicate);
                }
            }

            let mut status = status.clone();
            status.total_attempts = status.total_attempts.saturating_add(1);
            match attempt.outcome {
                AttemptOutcome::Success => status.successful_channels += 1,
                AttemptOutcome::Failure if attempt.terminal => status.failed_channels += 1,
                AttemptOutcome::Failure => {}
            }
            status.delivery_attempts.push(attempt.clone());
            Change::Write(status, AppendResult::Recorded)
        })
        .await
    }

    /// Move the phase forward. Terminal phases never change and phases never
    /// move backwards; entering a terminal phase stamps `completion_time`.
    /// Returns whether anything was written.
    pub async fn update_phase(&self, id: Uuid, phase: Phase) -> Result<bool, StatusError> {
        let now = self.clock.now();
        self.modify(id, |request| {
            let current = request.status.phase;
            if current == phase || current.is_terminal() || phase.rank() < current.rank() {
                return Change::Skip(false);
            }

            let mut status = request.status.clone();
            status.phase = phase;
            if phase.is_terminal() && status.completion_time.is_none() {
                status.completion_time = Some(now);
            }
            Change::Write(status, true)
        })
        .await
    }

    /// Upsert a condition by type. Identical conditions are not rewritten, and
    /// the transition time only moves when the status flips.
    /// Returns whether anything was written.
    pub async fn set_condition(&self, id: Uuid, condition: Condition) -> Result<bool, StatusError> {
        self.modify(id, |request| {
            let existing = request.status.condition(&condition.condition_type);
            if existing.is_some_and(|c| c.same_as(&condition)) {
                return Change::Skip(false);
            }

            let mut condition = condition.clone();
            if let Some(c) = existing.filter(|c| c.status == condition.status) {
                condition.last_transition_time = c.last_transition_time;
            }

            let mut status = request.status.clone();
            status
                .conditions
                .retain(|c| c.condition_type != condition.condition_type);
            status.conditions.push(condition);
            Change::Write(status, true)
        })
        .await
    }

    async fn modify<T, F>(&self, id: Uuid, mut decide: F) -> Result<T, StatusError>
    where
        F: FnMut(&NotificationRequest) -> Change<T> + Send,
        T: Send,
    {
        let mut conflicts = 0u32;
        loop {
            let current = self.load(id).await?;
            let (status, value) = match decide(&current.request) {
                Change::Skip(value) => return Ok(value),
                Change::Write(status, value) => (status, value),
            };

            match self
                .store
                .update_status(id, current.resource_version, &status)
                .await
            {
                Ok(_) => return Ok(value),
                Err(StoreError::NotFound(_)) => return Err(StatusError::Vanished(id)),
                Err(StoreError::Conflict { .. }) => {
                    conflicts += 1;
                    if conflicts > self.conflict_retries {
                        return Err(StatusError::Conflict {
                            id,
                            attempts: conflicts,
                        });
                    }
                    tracing::debug!(notification_id = %id, conflicts, "Status write conflicted, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Where one channel stands, derived purely from recorded attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelProgress {
    Succeeded,
    Failed,
    Pending {
        attempts: u32,
        next_retry_at: Option<DateTime<Utc>>,
    },
}

impl ChannelProgress {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChannelProgress::Pending { .. })
    }
}

pub fn channel_progress(
    status: &NotificationStatus,
    channel: &str,
    policy: &RetryPolicy,
) -> ChannelProgress {
    let mut attempts = 0u32;
    let mut next_retry_at = None;
    let mut failed = false;

    for attempt in status.attempts_for(channel) {
        if attempt.outcome == AttemptOutcome::Success {
            return ChannelProgress::Succeeded;
        }
        failed |= attempt.terminal;
        if attempt.attempt >= attempts {
            attempts = attempt.attempt;
            next_retry_at = attempt.next_retry_at;
        }
    }

    if failed || (attempts > 0 && policy.is_exhausted(attempts)) {
        ChannelProgress::Failed
    } else {
        ChannelProgress::Pending {
            attempts,
            next_retry_at,
        }
    }
}

/// Phase implied by per-channel progress.
pub fn aggregate_phase(progress: &[ChannelProgress]) -> Phase {
    if progress.iter().any(|p| !p.is_terminal()) {
        return Phase::Sending;
    }
    let succeeded = progress
        .iter()
        .filter(|p| **p == ChannelProgress::Succeeded)
        .count();
    match succeeded {
        0 => Phase::Failed,
        n if n == progress.len() => Phase::Sent,
        _ => Phase::PartiallySent,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use courier_common::types::{ConditionStatus, NotificationSpec, Priority};

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn attempt(channel: &str, n: u32, outcome: AttemptOutcome, terminal: bool) -> DeliveryAttempt {
        DeliveryAttempt {
            channel: channel.to_string(),
            attempt: n,
            timestamp: Utc::now(),
            outcome,
            terminal,
            permanent: false,
            error: None,
            duration_ms: 1,
            next_retry_at: None,
        }
    }

    async fn setup() -> (Arc<MemoryStore>, StatusManager, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let request = NotificationRequest::new(NotificationSpec {
            subject: "s".to_string(),
            body: "b".to_string(),
            priority: Priority::High,
            channels: vec!["console".to_string(), "slack".to_string()],
            recipients: vec![],
            retry_policy: None,
            correlation_id: None,
        });
        let id = store.create(request).await.unwrap().id();
        let manager = StatusManager::new(
            store.clone(),
            Arc::new(ManualClock::default()),
            DEFAULT_CONFLICT_RETRIES,
        );
        (store, manager, id)
    }

    #[tokio::test]
    async fn test_append_updates_counters() {
        let (_, manager, id) = setup().await;

        let r = manager
            .append_attempt(id, attempt("slack", 1, AttemptOutcome::Failure, false))
            .await
            .unwrap();
        assert_eq!(r, AppendResult::Recorded);
        manager
            .append_attempt(id, attempt("slack", 2, AttemptOutcome::Failure, true))
            .await
            .unwrap();
        manager
            .append_attempt(id, attempt("console", 1, AttemptOutcome::Success, true))
            .await
            .unwrap();

        let status = manager.load(id).await.unwrap().request.status;
        assert_eq!(status.total_attempts, 3);
        assert_eq!(status.successful_channels, 1);
        assert_eq!(status.failed_channels, 1);
        assert_eq!(status.delivery_attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_append_after_terminal_is_noop() {
        let (_, manager, id) = setup().await;
        manager
            .append_attempt(id, attempt("console", 1, AttemptOutcome::Success, true))
            .await
            .unwrap();

        let r = manager
            .append_attempt(id, attempt("console", 2, AttemptOutcome::Success, true))
            .await
            .unwrap();
        assert_eq!(r, AppendResult::AlreadyTerminal);

        let status = manager.load(id).await.unwrap().request.status;
        assert_eq!(status.delivery_attempts.len(), 1);
        assert_eq!(status.successful_channels, 1);
    }

    #[tokio::test]
    async fn test_duplicate_attempt_number_is_noop() {
        let (_, manager, id) = setup().await;
        manager
            .append_attempt(id, attempt("slack", 1, AttemptOutcome::Failure, false))
            .await
            .unwrap();
        let r = manager
            .append_attempt(id, attempt("slack", 1, AttemptOutcome::Failure, false))
            .await
            .unwrap();
        assert_eq!(r, AppendResult::Duplicate);
    }

    #[tokio::test]
    async fn test_append_to_terminal_notification_is_noop() {
        let (_, manager, id) = setup().await;
        manager.update_phase(id, Phase::Sending).await.unwrap();
        manager.update_phase(id, Phase::Failed).await.unwrap();

        let r = manager
            .append_attempt(id, attempt("slack", 1, AttemptOutcome::Success, true))
            .await
            .unwrap();
        assert_eq!(r, AppendResult::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_concurrent_success_appends_record_once() {
        let (_, manager, id) = setup().await;
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .append_attempt(id, attempt("console", 1, AttemptOutcome::Success, true))
                        .await
                })
            })
            .collect();

        let mut recorded = 0;
        for handle in handles {
            // Conflicts are allowed to surface; duplicates must not be persisted
            if let Ok(AppendResult::Recorded) = handle.await.unwrap() {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);

        let status = manager.load(id).await.unwrap().request.status;
        let successes = status
            .attempts_for("console")
            .filter(|a| a.outcome == AttemptOutcome::Success)
            .count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_phase_is_monotonic() {
        let (_, manager, id) = setup().await;
        assert!(manager.update_phase(id, Phase::Sending).await.unwrap());
        assert!(!manager.update_phase(id, Phase::Pending).await.unwrap());
        assert!(manager.update_phase(id, Phase::PartiallySent).await.unwrap());
        assert!(!manager.update_phase(id, Phase::Sent).await.unwrap());

        let status = manager.load(id).await.unwrap().request.status;
        assert_eq!(status.phase, Phase::PartiallySent);
        assert!(status.completion_time.is_some());
    }

    #[tokio::test]
    async fn test_identical_condition_not_rewritten() {
        let (store, manager, id) = setup().await;
        let condition = Condition {
            condition_type: "RoutingResolved".to_string(),
            status: ConditionStatus::True,
            reason: "RuleMatched".to_string(),
            message: "all channels resolved".to_string(),
            last_transition_time: Utc::now(),
        };

        assert!(manager.set_condition(id, condition.clone()).await.unwrap());
        let version = store.get(id).await.unwrap().unwrap().resource_version;

        let mut later = condition.clone();
        later.last_transition_time += TimeDelta::minutes(1);
        assert!(!manager.set_condition(id, later).await.unwrap());
        assert_eq!(store.get(id).await.unwrap().unwrap().resource_version, version);

        let mut flipped = condition.clone();
        flipped.status = ConditionStatus::False;
        flipped.reason = "Failed".to_string();
        assert!(manager.set_condition(id, flipped).await.unwrap());

        let status = manager.load(id).await.unwrap().request.status;
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].reason, "Failed");
    }

    #[tokio::test]
    async fn test_vanished_object() {
        let (store, manager, id) = setup().await;
        store.delete(id).await.unwrap();
        let err = manager.update_phase(id, Phase::Sending).await.unwrap_err();
        assert!(matches!(err, StatusError::Vanished(_)));
    }

    #[test]
    fn test_channel_progress() {
        let policy = RetryPolicy::default();
        let mut status = NotificationStatus::default();
        assert_eq!(
            channel_progress(&status, "slack", &policy),
            ChannelProgress::Pending {
                attempts: 0,
                next_retry_at: None
            }
        );

        for n in 1..=5 {
            status
                .delivery_attempts
                .push(attempt("slack", n, AttemptOutcome::Failure, false));
        }
        // Budget spent without a terminal record still counts as failed
        assert_eq!(channel_progress(&status, "slack", &policy), ChannelProgress::Failed);

        status
            .delivery_attempts
            .push(attempt("console", 1, AttemptOutcome::Success, true));
        assert_eq!(
            channel_progress(&status, "console", &policy),
            ChannelProgress::Succeeded
        );
    }

    #[test]
    fn test_aggregate_phase() {
        let pending = ChannelProgress::Pending {
            attempts: 1,
            next_retry_at: None,
        };
        use ChannelProgress::{Failed, Succeeded};
        assert_eq!(aggregate_phase(&[Succeeded, Succeeded]), Phase::Sent);
        assert_eq!(aggregate_phase(&[Succeeded, Failed]), Phase::PartiallySent);
        assert_eq!(aggregate_phase(&[Failed, Failed]), Phase::Failed);
        assert_eq!(aggregate_phase(&[Succeeded, pending]), Phase::Sending);
    }
}
