//! Console channel: one structured JSON line per delivery.

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::{ChannelError, DeliveryChannel, DeliveryReceipt, OutboundMessage};

pub struct ConsoleChannel {
    name: String,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleChannel {
    /// Console channel writing to stdout.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_writer(name, std::io::stdout())
    }

    /// Console channel writing to an arbitrary sink.
    pub fn with_writer(name: impl Into<String>, writer: impl Write + Send + 'static) -> Self {
        Self {
            name: name.into(),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    fn render(&self, message: &OutboundMessage) -> Result<String, ChannelError> {
        let line = json!({
            "channel": message.channel,
            "notification_id": message.notification_id,
            "correlation_id": message.correlation_id,
            "priority": message.priority,
            "subject": message.subject,
            "body": message.body,
            "recipients": message.recipients,
            "delivered_at": Utc::now().to_rfc3339(),
        });
        serde_json::to_string(&line).map_err(|e| ChannelError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl DeliveryChannel for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "console"
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ChannelError> {
        let line = self.render(message)?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ChannelError::Transport("console writer poisoned".to_string()))?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;

        Ok(DeliveryReceipt::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_common::types::Priority;
    use uuid::Uuid;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            notification_id: Uuid::new_v4(),
            correlation_id: "wf-7".to_string(),
            channel: "console".to_string(),
            subject: "Deploy finished".to_string(),
            body: "api v2 rolled out".to_string(),
            priority: Priority::High,
            recipients: vec!["ops".to_string()],
        }
    }

    #[tokio::test]
    async fn test_writes_one_json_line() {
        let buffer = SharedBuffer::default();
        let channel = ConsoleChannel::with_writer("console", buffer.clone());

        let msg = message();
        channel.deliver(&msg).await.unwrap();
        channel.deliver(&msg).await.unwrap();

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["subject"], "Deploy finished");
        assert_eq!(parsed["priority"], "high");
        assert_eq!(parsed["correlation_id"], "wf-7");
        assert_eq!(parsed["recipients"][0], "ops");
    }

    #[test]
    fn test_kind_and_name() {
        let channel = ConsoleChannel::new("stdout");
        assert_eq!(channel.name(), "stdout");
        assert_eq!(channel.kind(), "console");
    }
}
