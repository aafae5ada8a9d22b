//! Notification request routes.

use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{NotificationRequest, NotificationSpec, Phase};
use courier_engine::audit::{AuditEvent, event_types};
use courier_engine::store::ListFilter;

use crate::state::AppState;

pub const AUDIT_ACTOR: &str = "courier-api";
const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications", get(list_notifications).post(create_notification))
        .route("/notifications/{id}", get(get_notification))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub phase: Option<String>,
    pub limit: Option<usize>,
}

/// Admission checks for a new notification spec.
pub fn validate_spec(spec: &NotificationSpec) -> Result<(), AppError> {
    if spec.subject.trim().is_empty() {
        return Err(AppError::Validation("subject must not be empty".to_string()));
    }
    if spec.channels.is_empty() {
        return Err(AppError::Validation(
            "at least one channel is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for channel in &spec.channels {
        if channel.trim().is_empty() {
            return Err(AppError::Validation(
                "channel names must not be empty".to_string(),
            ));
        }
        if !seen.insert(channel.as_str()) {
            return Err(AppError::Validation(format!(
                "channel '{}' listed more than once",
                channel
            )));
        }
    }

    if spec.recipients.iter().any(|r| r.address.trim().is_empty()) {
        return Err(AppError::Validation(
            "recipient addresses must not be empty".to_string(),
        ));
    }

    if let Some(policy) = &spec.retry_policy {
        if policy.max_attempts == Some(0) {
            return Err(AppError::Validation(
                "retry_policy.max_attempts must be at least 1".to_string(),
            ));
        }
        if policy.backoff_multiplier == Some(0) {
            return Err(AppError::Validation(
                "retry_policy.backoff_multiplier must be at least 1".to_string(),
            ));
        }
        if let (Some(initial), Some(max)) =
            (policy.initial_backoff_seconds, policy.max_backoff_seconds)
        {
            if max < initial {
                return Err(AppError::Validation(
                    "retry_policy.max_backoff_seconds must not be below initial_backoff_seconds"
                        .to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// POST /notifications — Admit a new notification request.
async fn create_notification(
    State(state): State<AppState>,
    Json(spec): Json<NotificationSpec>,
) -> Result<(StatusCode, Json<NotificationRequest>), AppError> {
    validate_spec(&spec)?;

    let stored = state.store.create(NotificationRequest::new(spec)).await?;
    let request = stored.request;

    tracing::info!(
        notification_id = %request.id,
        channels = ?request.spec.channels,
        priority = %request.spec.priority,
        "Notification created"
    );

    if let Some(audit) = &state.audit {
        audit.emit(
            AuditEvent::for_notification(
                event_types::REQUEST_CREATED,
                request.id,
                request.correlation_id(),
                json!({
                    "channels": request.spec.channels,
                    "priority": request.spec.priority,
                    "recipients": request.spec.recipients.len(),
                }),
            )
            .with_actor(AUDIT_ACTOR),
        );
    }

    if let Some(queue) = &state.queue {
        queue.enqueue(request.id);
    }

    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /notifications/:id — Fetch one notification with its status.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationRequest>, AppError> {
    let stored = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
    Ok(Json(stored.request))
}

/// GET /notifications — List notifications, newest first.
async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<NotificationRequest>>, AppError> {
    let phase = query
        .phase
        .as_deref()
        .map(str::parse::<Phase>)
        .transpose()
        .map_err(AppError::Validation)?;

    let filter = ListFilter {
        phase,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)),
    };
    let notifications = state.store.list(&filter).await?;
    Ok(Json(notifications.into_iter().map(|n| n.request).collect()))
}

#[cfg(test)]
mod tests {
    use courier_common::types::{Priority, Recipient, RetryPolicySpec};

    use super::*;

    fn spec() -> NotificationSpec {
        NotificationSpec {
            subject: "Deploy finished".to_string(),
            body: "v1.4.2 is live".to_string(),
            priority: Priority::Low,
            channels: vec!["console".to_string()],
            recipients: vec![Recipient {
                address: "team@example.com".to_string(),
                channel: None,
            }],
            retry_policy: None,
            correlation_id: None,
        }
    }

    fn rejects(spec: NotificationSpec, fragment: &str) {
        match validate_spec(&spec) {
            Err(AppError::Validation(msg)) => assert!(msg.contains(fragment), "{}", msg),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(validate_spec(&spec()).is_ok());
    }

    #[test]
    fn test_rejects_bad_subject_and_channels() {
        let mut s = spec();
        s.subject = "  ".to_string();
        rejects(s, "subject");

        let mut s = spec();
        s.channels.clear();
        rejects(s, "at least one channel");

        let mut s = spec();
        s.channels.push("".to_string());
        rejects(s, "must not be empty");

        let mut s = spec();
        s.channels.push("console".to_string());
        rejects(s, "more than once");
    }

    #[test]
    fn test_rejects_blank_recipient() {
        let mut s = spec();
        s.recipients.push(Recipient {
            address: "".to_string(),
            channel: Some("console".to_string()),
        });
        rejects(s, "recipient");
    }

    #[test]
    fn test_rejects_bad_retry_policy() {
        let mut s = spec();
        s.retry_policy = Some(RetryPolicySpec {
            max_attempts: Some(0),
            ..Default::default()
        });
        rejects(s, "max_attempts");

        let mut s = spec();
        s.retry_policy = Some(RetryPolicySpec {
            backoff_multiplier: Some(0),
            ..Default::default()
        });
        rejects(s, "backoff_multiplier");

        let mut s = spec();
        s.retry_policy = Some(RetryPolicySpec {
            initial_backoff_seconds: Some(60),
            max_backoff_seconds: Some(10),
            ..Default::default()
        });
        rejects(s, "max_backoff_seconds");
    }
}
