//! Generic webhook channel.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::{ChannelError, DeliveryChannel, DeliveryReceipt, OutboundMessage};

/// Response bodies are truncated to this many characters in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Reset values above this are absolute unix timestamps, below it relative seconds.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// Webhook channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// HTTP method, POST or PUT (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<WebhookAuth>,
    /// Client-side request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Webhook authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebhookAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

pub struct WebhookChannel {
    name: String,
    config: WebhookConfig,
    headers: HeaderMap,
    client: Client,
}

impl WebhookChannel {
    pub fn new(name: impl Into<String>, config: WebhookConfig) -> Result<Self, ChannelError> {
        if config.url.trim().is_empty() {
            return Err(ChannelError::InvalidConfig("webhook url is empty".to_string()));
        }
        match config.method.to_uppercase().as_str() {
            "POST" | "PUT" => {}
            other => {
                return Err(ChannelError::InvalidConfig(format!(
                    "unsupported webhook method '{}'",
                    other
                )));
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChannelError::InvalidConfig(e.to_string()))?;
        let headers = build_headers(&config)?;

        Ok(Self {
            name: name.into(),
            config,
            headers,
            client,
        })
    }

    fn build_payload(&self, message: &OutboundMessage) -> serde_json::Value {
        json!({
            "notification_id": message.notification_id,
            "correlation_id": message.correlation_id,
            "channel": message.channel,
            "priority": message.priority,
            "subject": message.subject,
            "body": message.body,
            "recipients": message.recipients,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), ChannelError> {
    let header_name = name
        .parse::<HeaderName>()
        .map_err(|_| ChannelError::InvalidConfig(format!("invalid header name '{}'", name)))?;
    let header_value = value
        .parse::<HeaderValue>()
        .map_err(|_| ChannelError::InvalidConfig(format!("invalid value for header '{}'", name)))?;
    Ok((header_name, header_value))
}

fn build_headers(config: &WebhookConfig) -> Result<HeaderMap, ChannelError> {
    let mut headers = HeaderMap::new();

    for (name, value) in &config.headers {
        let (name, value) = header_pair(name, value)?;
        headers.insert(name, value);
    }

    match &config.auth {
        Some(WebhookAuth::Bearer { token }) => {
            let (name, value) = header_pair("authorization", &format!("Bearer {}", token))?;
            headers.insert(name, value);
        }
        Some(WebhookAuth::Header { name, value }) => {
            let (name, value) = header_pair(name, value)?;
            headers.insert(name, value);
        }
        // Applied on the request builder
        Some(WebhookAuth::Basic { .. }) | None => {}
    }

    Ok(headers)
}

/// Map a non-2xx response to a channel error.
pub fn error_from_response(
    status: u16,
    headers: &HeaderMap,
    body: &str,
    now: DateTime<Utc>,
) -> ChannelError {
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    match status {
        429 => ChannelError::RateLimited {
            retry_after: retry_after_hint(headers, now),
        },
        401 | 403 => ChannelError::Unauthorized(format!("HTTP {}: {}", status, body)),
        _ => ChannelError::Http { status, body },
    }
}

/// Provider-supplied backoff hint from `Retry-After` (seconds or HTTP date)
/// or `X-RateLimit-Reset` (relative seconds or unix timestamp).
pub fn retry_after_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(raw) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) {
        let raw = raw.trim();
        if let Ok(secs) = raw.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        if let Ok(at) = DateTime::parse_from_rfc2822(raw) {
            let delta = at.with_timezone(&Utc) - now;
            return Some(delta.to_std().unwrap_or(Duration::ZERO));
        }
    }

    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let secs = if reset >= EPOCH_THRESHOLD {
        reset - now.timestamp()
    } else {
        reset
    };
    Some(Duration::from_secs(secs.max(0) as u64))
}

fn map_send_error(error: reqwest::Error, timeout: Duration) -> ChannelError {
    if error.is_timeout() {
        ChannelError::Timeout(timeout)
    } else if error.is_builder() {
        ChannelError::InvalidConfig(error.to_string())
    } else {
        ChannelError::Transport(error.to_string())
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ChannelError> {
        let payload = self.build_payload(message);

        let mut request = if self.config.method.eq_ignore_ascii_case("PUT") {
            self.client.put(&self.config.url)
        } else {
            self.client.post(&self.config.url)
        };
        request = request.headers(self.headers.clone()).json(&payload);

        if let Some(WebhookAuth::Basic { username, password }) = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(e, Duration::from_secs(self.config.timeout_secs)))?;

        let status = response.status();
        if status.is_success() {
            debug!(channel = %self.name, status = status.as_u16(), "Webhook delivered");
            return Ok(DeliveryReceipt {
                detail: Some(format!("HTTP {}", status.as_u16())),
            });
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        warn!(channel = %self.name, status = status.as_u16(), "Webhook rejected delivery");

        Err(error_from_response(status.as_u16(), &headers, &body, Utc::now()))
    }
}
