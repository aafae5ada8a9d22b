use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{AuditError, AuditEvent};

/// Destination for flushed audit batches.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), AuditError>;
}

/// POSTs `{"events": [...]}` to an HTTP endpoint.
pub struct HttpAuditSink {
    client: Client,
    url: String,
}

impl HttpAuditSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AuditError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "events": events }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuditError::Sink(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        Ok(())
    }
}

/// Writes audit events as structured log lines. Used when no sink is configured.
#[derive(Debug, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        for event in events {
            tracing::info!(
                target: "courier::audit",
                event_id = %event.event_id,
                event_type = %event.event_type,
                correlation_id = %event.correlation_id,
                actor = %event.actor,
                resource_kind = %event.resource.kind,
                resource_id = %event.resource.id,
                retention_days = event.retention_days,
                payload = %event.payload,
                "Audit event"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use uuid::Uuid;

    use super::*;
    use crate::audit::event_types;

    async fn spawn_sink(status: StatusCode) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let captured = received.clone();
        let app = Router::new().route(
            "/audit",
            post(move |Json(body): Json<serde_json::Value>| {
                let captured = captured.clone();
                async move {
                    captured.lock().unwrap().push(body);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/audit", addr), received)
    }

    fn event() -> AuditEvent {
        AuditEvent::for_notification(
            event_types::MESSAGE_SENT,
            Uuid::new_v4(),
            "wf-1",
            json!({"channel": "console"}),
        )
    }

    #[tokio::test]
    async fn test_http_sink_posts_batch() {
        let (url, received) = spawn_sink(StatusCode::OK).await;
        let sink = HttpAuditSink::new(url, Duration::from_secs(5)).unwrap();

        sink.write_batch(&[event(), event()]).await.unwrap();

        let bodies = received.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["events"].as_array().unwrap().len(), 2);
        assert_eq!(bodies[0]["events"][0]["event_type"], "notification.message.sent");
    }

    #[tokio::test]
    async fn test_http_sink_rejects_non_2xx() {
        let (url, _) = spawn_sink(StatusCode::BAD_GATEWAY).await;
        let sink = HttpAuditSink::new(url, Duration::from_secs(5)).unwrap();
        let err = sink.write_batch(&[event()]).await.unwrap_err();
        assert!(matches!(err, AuditError::Sink(_)));
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        assert!(LogAuditSink.write_batch(&[event()]).await.is_ok());
    }
}
