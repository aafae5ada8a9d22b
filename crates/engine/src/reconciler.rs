//! Reconciler: drives one notification toward a terminal phase.
//!
//! One invocation:
//! 1. Re-read the object from the store; terminal objects are left alone
//! 2. Resolve spec channels against the registry, record `RoutingResolved`
//! 3. Sanitize subject and body once
//! 4. Move `Pending` to `Sending`
//! 5. Dispatch every unresolved channel concurrently. Each outcome is recorded
//!    as a `DeliveryAttempt` before anything reacts to it.
//! 6. Recompute the phase from the recorded attempts
//! 7. Finish, or ask to be requeued after the shortest pending wait
//!
//! Invocations may overlap for the same notification. Safety comes from the
//! fresh reads, version-checked writes and idempotent appends in
//! `StatusManager`, plus a process-local claim per (notification, channel)
//! so one process never dispatches the same channel twice at once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use courier_common::types::{
    AttemptOutcome, CONDITION_ROUTING_RESOLVED, CONDITION_SANITIZATION_DEGRADED, Condition,
    ConditionStatus, DeliveryAttempt, NotificationSpec, Phase,
};
use courier_notifier::{ChannelError, ChannelRegistry, Classification, OutboundMessage};

use crate::audit::{AuditEmitter, AuditEvent, event_types};
use crate::circuit_breaker::{Admission, CircuitBreakers, CircuitState, Transition};
use crate::clock::{Clock, to_delta, until};
use crate::retry::RetryPolicy;
use crate::sanitizer::Sanitizer;
use crate::status::{AppendResult, ChannelProgress, StatusError, StatusManager, aggregate_phase, channel_progress};
use crate::telemetry;

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLAIM_RECHECK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound on a single `deliver` call.
    pub delivery_timeout: Duration,
    /// Used when a notification names no channels.
    pub fallback_channels: Vec<String>,
    /// ± fraction applied to retry spacing.
    pub retry_jitter: f64,
    /// Requeue delay for a channel another invocation is dispatching.
    pub claim_recheck: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            fallback_channels: vec!["console".to_string()],
            retry_jitter: 0.1,
            claim_recheck: DEFAULT_CLAIM_RECHECK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    RequeueAfter(Duration),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Status(#[from] StatusError),
}

/// Anything the worker pool can drive.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, id: Uuid) -> Result<ReconcileOutcome, ReconcileError>;
}

struct Routing {
    channels: Vec<String>,
    condition: Condition,
}

/// Per-invocation context shared by the channel fan-out.
struct Invocation<'a> {
    id: Uuid,
    correlation_id: String,
    spec: &'a NotificationSpec,
    policy: RetryPolicy,
    subject: String,
    body: String,
    /// Serializes status appends of sibling channels.
    append_lock: tokio::sync::Mutex<()>,
}

enum ChannelStep {
    Settled,
    /// Another invocation in this process holds the dispatch claim.
    Busy,
}

type ClaimKey = (Uuid, String);

struct DispatchClaim {
    claims: Arc<DashMap<ClaimKey, ()>>,
    key: ClaimKey,
}

impl Drop for DispatchClaim {
    fn drop(&mut self) {
        self.claims.remove(&self.key);
    }
}

pub struct Reconciler {
    status: StatusManager,
    channels: ChannelRegistry,
    breakers: Arc<CircuitBreakers>,
    sanitizer: Sanitizer,
    audit: AuditEmitter,
    clock: Arc<dyn Clock>,
    claims: Arc<DashMap<ClaimKey, ()>>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        status: StatusManager,
        channels: ChannelRegistry,
        breakers: Arc<CircuitBreakers>,
        sanitizer: Sanitizer,
        audit: AuditEmitter,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            status,
            channels,
            breakers,
            sanitizer,
            audit,
            clock,
            claims: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    async fn run(&self, id: Uuid) -> Result<ReconcileOutcome, ReconcileError> {
        // 1. Fresh read
        let stored = self.status.load(id).await?;
        let request = &stored.request;
        if request.status.phase.is_terminal() {
            tracing::debug!(notification_id = %id, phase = %request.status.phase, "Already terminal");
            return Ok(ReconcileOutcome::Done);
        }
        let correlation_id = request.correlation_id();

        // 2. Routing
        let routing = self.resolve_routing(&request.spec);
        self.status.set_condition(id, routing.condition).await?;

        // 3. Sanitize once
        let subject = self.sanitizer.sanitize(&request.spec.subject);
        let body = self.sanitizer.sanitize(&request.spec.body);
        if subject.degraded || body.degraded {
            self.flag_degraded_sanitization(id, &correlation_id, subject.degraded, body.degraded)
                .await?;
        }

        // 4. Pending -> Sending
        if self.status.update_phase(id, Phase::Sending).await? {
            telemetry::record_phase(Phase::Sending);
            tracing::info!(notification_id = %id, channels = routing.channels.len(), "Delivery started");
            self.audit.emit(AuditEvent::for_notification(
                event_types::DELIVERY_STARTED,
                id,
                correlation_id.as_str(),
                json!({
                    "channels": routing.channels,
                    "priority": request.spec.priority,
                    "subject": subject.text,
                }),
            ));
        }

        // 5. Fan out
        let invocation = Invocation {
            id,
            correlation_id,
            spec: &request.spec,
            policy: RetryPolicy::from_spec(request.spec.retry_policy.as_ref()),
            subject: subject.text,
            body: body.text,
            append_lock: tokio::sync::Mutex::new(()),
        };
        let results = join_all(
            routing
                .channels
                .iter()
                .map(|channel| self.reconcile_channel(&invocation, channel)),
        )
        .await;

        let mut busy = HashSet::new();
        for (channel, result) in routing.channels.iter().zip(results) {
            if let ChannelStep::Busy = result? {
                busy.insert(channel.as_str());
            }
        }

        // 6. Aggregate from what is actually recorded
        let fresh = self.status.load(id).await?;
        let status = fresh.status();
        let progress: Vec<ChannelProgress> = routing
            .channels
            .iter()
            .map(|c| channel_progress(status, c, &invocation.policy))
            .collect();
        let phase = aggregate_phase(&progress);

        if phase.is_terminal() {
            if self.status.update_phase(id, phase).await? {
                telemetry::record_phase(phase);
                tracing::info!(
                    notification_id = %id,
                    phase = %phase,
                    successful_channels = status.successful_channels,
                    failed_channels = status.failed_channels,
                    "Notification completed"
                );
                self.audit.emit(AuditEvent::for_notification(
                    event_types::REQUEST_COMPLETED,
                    id,
                    invocation.correlation_id.as_str(),
                    json!({
                        "phase": phase,
                        "successful_channels": status.successful_channels,
                        "failed_channels": status.failed_channels,
                        "total_attempts": status.total_attempts,
                    }),
                ));
            }
            return Ok(ReconcileOutcome::Done);
        }

        // 7. Requeue after the shortest wait
        let now = self.clock.now();
        let wait = routing
            .channels
            .iter()
            .zip(&progress)
            .filter_map(|(channel, p)| match p {
                ChannelProgress::Pending { next_retry_at, .. } => {
                    Some(match next_retry_at {
                        Some(at) if !busy.contains(channel.as_str()) => until(*at, now),
                        _ => self.config.claim_recheck,
                    })
                }
                _ => None,
            })
            .min()
            .unwrap_or(self.config.claim_recheck);

        tracing::debug!(notification_id = %id, wait_ms = wait.as_millis() as u64, "Requeue");
        Ok(ReconcileOutcome::RequeueAfter(wait))
    }

    fn resolve_routing(&self, spec: &NotificationSpec) -> Routing {
        let now = self.clock.now();
        let (requested, fallback) = if spec.channels.is_empty() {
            (self.config.fallback_channels.clone(), true)
        } else {
            (spec.channels.clone(), false)
        };

        let mut seen = HashSet::new();
        let channels: Vec<String> = requested
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .collect();
        let unknown: Vec<&str> = channels
            .iter()
            .filter(|c| !self.channels.contains(c))
            .map(String::as_str)
            .collect();

        let (status, reason, message) = if !unknown.is_empty() {
            (
                ConditionStatus::False,
                "Failed",
                format!("channels not configured: {}", unknown.join(", ")),
            )
        } else if fallback {
            (
                ConditionStatus::True,
                "Fallback",
                format!("no channels requested, using fallback: {}", channels.join(", ")),
            )
        } else {
            (
                ConditionStatus::True,
                "RuleMatched",
                format!("all {} channels resolved", channels.len()),
            )
        };

        Routing {
            channels,
            condition: Condition {
                condition_type: CONDITION_ROUTING_RESOLVED.to_string(),
                status,
                reason: reason.to_string(),
                message,
                last_transition_time: now,
            },
        }
    }

    async fn flag_degraded_sanitization(
        &self,
        id: Uuid,
        correlation_id: &str,
        subject: bool,
        body: bool,
    ) -> Result<(), ReconcileError> {
        let fields: Vec<&str> = [("subject", subject), ("body", body)]
            .into_iter()
            .filter_map(|(name, degraded)| degraded.then_some(name))
            .collect();

        let condition = Condition {
            condition_type: CONDITION_SANITIZATION_DEGRADED.to_string(),
            status: ConditionStatus::True,
            reason: "FallbackRedaction".to_string(),
            message: format!("coarse redaction applied to {}", fields.join(" and ")),
            last_transition_time: self.clock.now(),
        };

        if self.status.set_condition(id, condition).await? {
            tracing::warn!(notification_id = %id, fields = ?fields, "Sanitization degraded");
            self.audit.emit(AuditEvent::for_notification(
                event_types::SANITIZATION_DEGRADED,
                id,
                correlation_id,
                json!({ "fields": fields }),
            ));
        }
        Ok(())
    }

    fn claim(&self, id: Uuid, channel: &str) -> Option<DispatchClaim> {
        let key = (id, channel.to_string());
        match self.claims.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(DispatchClaim {
                    claims: self.claims.clone(),
                    key,
                })
            }
        }
    }

    async fn reconcile_channel(
        &self,
        inv: &Invocation<'_>,
        name: &str,
    ) -> Result<ChannelStep, ReconcileError> {
        let Some(channel) = self.channels.get(name) else {
            let number = self.next_attempt_number(inv.id, name).await?;
            let attempt = self.failure_attempt(
                name,
                number,
                format!("channel not configured: {}", name),
                Classification::Permanent,
                &inv.policy,
                Duration::ZERO,
            );
            self.record(inv, attempt, "failure", None).await?;
            return Ok(ChannelStep::Settled);
        };

        let Some(_claim) = self.claim(inv.id, name) else {
            tracing::debug!(notification_id = %inv.id, channel = name, "Channel busy in another invocation");
            return Ok(ChannelStep::Busy);
        };

        // Re-read under the claim: a sibling invocation may have just finished
        let fresh = self.status.load(inv.id).await?;
        if fresh.status().phase.is_terminal() {
            return Ok(ChannelStep::Settled);
        }
        let (attempts, next_retry_at) = match channel_progress(fresh.status(), name, &inv.policy) {
            ChannelProgress::Pending {
                attempts,
                next_retry_at,
            } => (attempts, next_retry_at),
            ChannelProgress::Succeeded | ChannelProgress::Failed => {
                return Ok(ChannelStep::Settled);
            }
        };

        let now = self.clock.now();
        if next_retry_at.is_some_and(|at| at > now) {
            return Ok(ChannelStep::Settled);
        }
        let number = attempts + 1;

        let recipients: Vec<String> = inv
            .spec
            .recipients_for(name)
            .map(|r| r.address.clone())
            .collect();
        if recipients.is_empty() {
            let attempt = self.failure_attempt(
                name,
                number,
                format!("no recipients configured for channel {}", name),
                Classification::Permanent,
                &inv.policy,
                Duration::ZERO,
            );
            self.record(inv, attempt, "failure", None).await?;
            return Ok(ChannelStep::Settled);
        }

        if let Admission::Rejected { retry_in } = self.breakers.allow(name) {
            let attempt = self.failure_attempt(
                name,
                number,
                format!("circuit breaker open for channel {}", name),
                Classification::Retryable {
                    retry_after: Some(retry_in),
                },
                &inv.policy,
                Duration::ZERO,
            );
            self.record(inv, attempt, "circuit_open", None).await?;
            return Ok(ChannelStep::Settled);
        }

        if number > 1 {
            telemetry::record_retry(name);
        }

        let message = OutboundMessage {
            notification_id: inv.id,
            correlation_id: inv.correlation_id.clone(),
            channel: name.to_string(),
            subject: inv.subject.clone(),
            body: inv.body.clone(),
            priority: inv.spec.priority,
            recipients,
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.delivery_timeout, channel.deliver(&message)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(self.config.delivery_timeout)),
        };
        let elapsed = started.elapsed();
        telemetry::record_delivery_duration(name, elapsed);

        let (attempt, label) = match &result {
            Ok(_) => (
                DeliveryAttempt {
                    channel: name.to_string(),
                    attempt: number,
                    timestamp: self.clock.now(),
                    outcome: AttemptOutcome::Success,
                    terminal: true,
                    permanent: false,
                    error: None,
                    duration_ms: elapsed.as_millis() as u64,
                    next_retry_at: None,
                },
                "success",
            ),
            Err(e) => (
                self.failure_attempt(
                    name,
                    number,
                    self.sanitizer.sanitize(&e.to_string()).text,
                    channel.classify(e),
                    &inv.policy,
                    elapsed,
                ),
                "failure",
            ),
        };

        self.record(inv, attempt, label, Some(result.is_ok())).await?;
        Ok(ChannelStep::Settled)
    }

    async fn next_attempt_number(&self, id: Uuid, channel: &str) -> Result<u32, ReconcileError> {
        let fresh = self.status.load(id).await?;
        let last = fresh
            .status()
            .attempts_for(channel)
            .map(|a| a.attempt)
            .max()
            .unwrap_or(0);
        Ok(last + 1)
    }

    fn failure_attempt(
        &self,
        channel: &str,
        number: u32,
        error: String,
        classification: Classification,
        policy: &RetryPolicy,
        elapsed: Duration,
    ) -> DeliveryAttempt {
        let now = self.clock.now();
        let permanent = classification.is_permanent();
        let terminal = permanent || policy.is_exhausted(number);
        let next_retry_at = (!terminal).then(|| {
            let delay = policy.retry_delay(number, classification.retry_after(), self.config.retry_jitter);
            now + to_delta(delay)
        });

        DeliveryAttempt {
            channel: channel.to_string(),
            attempt: number,
            timestamp: now,
            outcome: AttemptOutcome::Failure,
            terminal,
            permanent,
            error: Some(error),
            duration_ms: elapsed.as_millis() as u64,
            next_retry_at,
        }
    }

    /// Record first, react second.
    async fn record(
        &self,
        inv: &Invocation<'_>,
        attempt: DeliveryAttempt,
        label: &'static str,
        breaker_outcome: Option<bool>,
    ) -> Result<(), ReconcileError> {
        let appended = {
            let _guard = inv.append_lock.lock().await;
            self.status.append_attempt(inv.id, attempt.clone()).await
        };

        if let Some(success) = breaker_outcome {
            if let Some(transition) = self.breakers.record_outcome(&attempt.channel, success) {
                self.emit_circuit_transition(&attempt.channel, transition);
            }
        }

        let appended = appended?;
        if appended != AppendResult::Recorded {
            tracing::debug!(
                notification_id = %inv.id,
                channel = %attempt.channel,
                attempt = attempt.attempt,
                result = ?appended,
                "Attempt not recorded"
            );
            return Ok(());
        }

        telemetry::record_attempt(&attempt.channel, label);

        let (event_type, payload) = match (attempt.outcome, attempt.terminal) {
            (AttemptOutcome::Success, _) => {
                tracing::info!(
                    notification_id = %inv.id,
                    channel = %attempt.channel,
                    attempt = attempt.attempt,
                    duration_ms = attempt.duration_ms,
                    "Message delivered"
                );
                (
                    event_types::MESSAGE_SENT,
                    json!({
                        "channel": attempt.channel,
                        "attempt": attempt.attempt,
                        "duration_ms": attempt.duration_ms,
                        "subject": inv.subject,
                    }),
                )
            }
            (AttemptOutcome::Failure, true) => {
                tracing::warn!(
                    notification_id = %inv.id,
                    channel = %attempt.channel,
                    attempt = attempt.attempt,
                    permanent = attempt.permanent,
                    error = attempt.error.as_deref().unwrap_or_default(),
                    "Channel failed"
                );
                (
                    event_types::MESSAGE_FAILED,
                    json!({
                        "channel": attempt.channel,
                        "attempt": attempt.attempt,
                        "permanent": attempt.permanent,
                        "error": attempt.error,
                    }),
                )
            }
            (AttemptOutcome::Failure, false) => {
                tracing::info!(
                    notification_id = %inv.id,
                    channel = %attempt.channel,
                    attempt = attempt.attempt,
                    error = attempt.error.as_deref().unwrap_or_default(),
                    "Delivery failed, will retry"
                );
                (
                    event_types::MESSAGE_RETRYING,
                    json!({
                        "channel": attempt.channel,
                        "attempt": attempt.attempt,
                        "error": attempt.error,
                        "next_retry_at": attempt.next_retry_at,
                    }),
                )
            }
        };

        self.audit.emit(AuditEvent::for_notification(
            event_type,
            inv.id,
            inv.correlation_id.as_str(),
            payload,
        ));
        Ok(())
    }

    fn emit_circuit_transition(&self, channel: &str, transition: Transition) {
        let event_type = match transition.to {
            CircuitState::Open => event_types::CIRCUIT_OPENED,
            CircuitState::Closed => event_types::CIRCUIT_CLOSED,
            CircuitState::HalfOpen => return,
        };
        self.audit.emit(AuditEvent::for_channel(
            event_type,
            channel,
            json!({
                "channel": channel,
                "from": transition.from,
                "to": transition.to,
                "consecutive_failures": transition.consecutive_failures,
                "cooldown_secs": self.breakers.config().cooldown.as_secs(),
            }),
        ));
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, id: Uuid) -> Result<ReconcileOutcome, ReconcileError> {
        let started = Instant::now();
        let result = match self.run(id).await {
            Err(ReconcileError::Status(StatusError::Vanished(_))) => {
                tracing::debug!(notification_id = %id, "Notification vanished, nothing to do");
                Ok(ReconcileOutcome::Done)
            }
            other => other,
        };
        telemetry::record_reconcile_duration(started.elapsed());
        result
    }
}
