//! Delivery channels.
//!
//! Every channel is a narrow capability: deliver one already-sanitized message,
//! and classify whatever went wrong as retryable or permanent. The engine acts
//! on the classification, never on the raw error.
//!
//! Adapters:
//! - Console (structured JSON lines on stdout)
//! - File (atomically renamed JSON/YAML artifacts)
//! - Webhook (HTTP POST/PUT with rate-limit aware error mapping)

pub mod console;
pub mod error;
pub mod file;
pub mod registry;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_common::types::Priority;

pub use console::ConsoleChannel;
pub use error::{ChannelError, Classification};
pub use file::{FileChannel, FileFormat};
pub use registry::{ChannelConfig, ChannelRegistry};
pub use webhook::{WebhookAuth, WebhookChannel, WebhookConfig};

/// Sanitized content handed to a channel for one delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub notification_id: Uuid,
    pub correlation_id: String,
    /// Name of the channel this message is addressed to.
    pub channel: String,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub recipients: Vec<String>,
}

/// What a channel reports back after a successful delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Channel-specific detail (HTTP status, artifact path, ...)
    pub detail: Option<String>,
}

/// Trait that all delivery channel adapters implement.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Configured channel name, as referenced by notification specs.
    fn name(&self) -> &str;

    /// Adapter kind (e.g. "console", "file", "webhook").
    fn kind(&self) -> &'static str;

    /// Deliver one message. The caller bounds the call with its own timeout.
    async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ChannelError>;

    /// Classify an error produced by this channel.
    fn classify(&self, error: &ChannelError) -> Classification {
        error.classify()
    }
}
