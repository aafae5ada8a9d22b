use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Condition type recording how the requested channels were resolved.
pub const CONDITION_ROUTING_RESOLVED: &str = "RoutingResolved";

/// Condition type set when content had to be redacted with the coarse fallback pass.
pub const CONDITION_SANITIZATION_DEGRADED: &str = "SanitizationDegraded";

/// Notification priority, lowest to highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Coarse lifecycle state of a notification.
///
/// Transitions are monotonic: `Pending → Sending → {Sent | PartiallySent | Failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Sending,
    Sent,
    PartiallySent,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Sent | Phase::PartiallySent | Phase::Failed)
    }

    /// Position in the lifecycle. Terminal phases share the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::Sending => 1,
            Phase::Sent | Phase::PartiallySent | Phase::Failed => 2,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Sending => write!(f, "Sending"),
            Phase::Sent => write!(f, "Sent"),
            Phase::PartiallySent => write!(f, "PartiallySent"),
            Phase::Failed => write!(f, "Failed"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Phase::Pending),
            "Sending" => Ok(Phase::Sending),
            "Sent" => Ok(Phase::Sent),
            "PartiallySent" => Ok(Phase::PartiallySent),
            "Failed" => Ok(Phase::Failed),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

/// A delivery target address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Address in whatever form the channel understands (email, chat id, URL, ...)
    pub address: String,
    /// Restrict this recipient to one channel. `None` means every channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Recipient {
    pub fn applies_to(&self, channel: &str) -> bool {
        self.channel.as_deref().is_none_or(|c| c == channel)
    }
}

/// Per-notification override of the retry schedule.
///
/// Omitted fields fall back to the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicySpec {
    pub max_attempts: Option<u32>,
    pub initial_backoff_seconds: Option<u64>,
    pub backoff_multiplier: Option<u32>,
    pub max_backoff_seconds: Option<u64>,
}

/// Write-once description of what to send and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSpec {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    /// Ordered set of channel names.
    pub channels: Vec<String>,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicySpec>,
    /// Correlation id of the originating workflow, carried into every audit event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl NotificationSpec {
    /// Recipients that apply to `channel`.
    pub fn recipients_for<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a Recipient> {
        self.recipients.iter().filter(move |r| r.applies_to(channel))
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "success"),
            AttemptOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// One immutable record of a single try at delivering to one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub channel: String,
    /// 1-based, monotonic per channel.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Set when this attempt closed the channel (success, permanent failure or exhausted budget).
    #[serde(default)]
    pub terminal: bool,
    /// The failure was classified permanent.
    #[serde(default)]
    pub permanent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Earliest time the next attempt for this channel may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    pub fn is_terminal(&self) -> bool {
        self.terminal || self.outcome == AttemptOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

/// Human-readable status condition, in the usual `type/status/reason/message` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Whether `other` carries the same information, ignoring the timestamp.
    pub fn same_as(&self, other: &Condition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Engine-owned status of a notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationStatus {
    pub phase: Phase,
    /// Append-only, in recording order.
    #[serde(default)]
    pub delivery_attempts: Vec<DeliveryAttempt>,
    #[serde(default)]
    pub total_attempts: u32,
    #[serde(default)]
    pub successful_channels: u32,
    #[serde(default)]
    pub failed_channels: u32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl NotificationStatus {
    /// Attempts recorded for `channel`, oldest first.
    pub fn attempts_for<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a DeliveryAttempt> {
        self.delivery_attempts
            .iter()
            .filter(move |a| a.channel == channel)
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// The declarative unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: Uuid,
    pub spec: NotificationSpec,
    #[serde(default)]
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    /// Create a fresh request in `Pending` phase.
    pub fn new(spec: NotificationSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            status: NotificationStatus::default(),
            created_at: Utc::now(),
        }
    }

    /// Correlation id for audit events, defaulting to the notification id.
    pub fn correlation_id(&self) -> String {
        self.spec
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(channel: &str, n: u32, outcome: AttemptOutcome, terminal: bool) -> DeliveryAttempt {
        DeliveryAttempt {
            channel: channel.to_string(),
            attempt: n,
            timestamp: Utc::now(),
            outcome,
            terminal,
            permanent: false,
            error: None,
            duration_ms: 3,
            next_retry_at: None,
        }
    }

    #[test]
    fn test_phase_terminal() {
        assert!(!Phase::Pending.is_terminal());
        assert!(!Phase::Sending.is_terminal());
        assert!(Phase::Sent.is_terminal());
        assert!(Phase::PartiallySent.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::Sending.rank() > Phase::Pending.rank());
    }

    #[test]
    fn test_phase_roundtrips_through_display() {
        for phase in [
            Phase::Pending,
            Phase::Sending,
            Phase::Sent,
            Phase::PartiallySent,
            Phase::Failed,
        ] {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
        assert!("sent".parse::<Phase>().is_err());
    }

    #[test]
    fn test_success_attempt_is_terminal() {
        assert!(attempt("console", 1, AttemptOutcome::Success, false).is_terminal());
        assert!(!attempt("console", 1, AttemptOutcome::Failure, false).is_terminal());
        assert!(attempt("console", 5, AttemptOutcome::Failure, true).is_terminal());
    }

    #[test]
    fn test_recipients_for_channel() {
        let spec = NotificationSpec {
            subject: "s".to_string(),
            body: "b".to_string(),
            priority: Priority::High,
            channels: vec!["email".to_string(), "slack".to_string()],
            recipients: vec![
                Recipient {
                    address: "ops@example.com".to_string(),
                    channel: Some("email".to_string()),
                },
                Recipient {
                    address: "oncall".to_string(),
                    channel: None,
                },
            ],
            retry_policy: None,
            correlation_id: None,
        };
        assert_eq!(spec.recipients_for("email").count(), 2);
        assert_eq!(spec.recipients_for("slack").count(), 1);
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: NotificationSpec = serde_json::from_value(serde_json::json!({
            "subject": "Disk full",
            "body": "node-1 /var is at 99%",
            "channels": ["console"]
        }))
        .unwrap();
        assert_eq!(spec.priority, Priority::Medium);
        assert!(spec.recipients.is_empty());
        assert!(spec.retry_policy.is_none());
    }

    #[test]
    fn test_status_serializes_phase_and_condition_type() {
        let mut status = NotificationStatus {
            phase: Phase::PartiallySent,
            ..Default::default()
        };
        status.conditions.push(Condition {
            condition_type: CONDITION_ROUTING_RESOLVED.to_string(),
            status: ConditionStatus::True,
            reason: "RuleMatched".to_string(),
            message: "all channels resolved".to_string(),
            last_transition_time: Utc::now(),
        });
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "PartiallySent");
        assert_eq!(json["conditions"][0]["type"], "RoutingResolved");
        assert_eq!(json["conditions"][0]["status"], "True");
    }

    #[test]
    fn test_correlation_id_defaults_to_notification_id() {
        let mut request = NotificationRequest::new(NotificationSpec {
            subject: "s".to_string(),
            body: "b".to_string(),
            priority: Priority::Low,
            channels: vec!["console".to_string()],
            recipients: vec![],
            retry_policy: None,
            correlation_id: None,
        });
        assert_eq!(request.correlation_id(), request.id.to_string());
        request.spec.correlation_id = Some("wf-42".to_string());
        assert_eq!(request.correlation_id(), "wf-42");
    }
}
