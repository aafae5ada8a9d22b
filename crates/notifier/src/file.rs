//! File channel: one artifact per delivery under a configured directory.
//!
//! Artifacts are named `<notification-id>-<channel>-<unix-millis>.<ext>` and
//! written to a hidden temporary file first, then renamed into place, so a
//! reader never observes a partially written artifact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChannelError, DeliveryChannel, DeliveryReceipt, OutboundMessage};

/// On-disk artifact encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Json,
    Yaml,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Json => "json",
            FileFormat::Yaml => "yaml",
        }
    }
}

#[derive(Serialize)]
struct Artifact<'a> {
    #[serde(flatten)]
    message: &'a OutboundMessage,
    delivered_at: DateTime<Utc>,
}

pub struct FileChannel {
    name: String,
    directory: PathBuf,
    format: FileFormat,
}

impl FileChannel {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, format: FileFormat) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            format,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn encode(&self, artifact: &Artifact<'_>) -> Result<Vec<u8>, ChannelError> {
        match self.format {
            FileFormat::Json => serde_json::to_vec_pretty(artifact)
                .map_err(|e| ChannelError::Serialization(e.to_string())),
            FileFormat::Yaml => serde_yaml::to_string(artifact)
                .map(String::into_bytes)
                .map_err(|e| ChannelError::Serialization(e.to_string())),
        }
    }

    async fn ensure_directory(&self) -> Result<(), ChannelError> {
        match tokio::fs::metadata(&self.directory).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ChannelError::InvalidConfig(format!(
                "{} is not a directory",
                self.directory.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ChannelError::InvalidConfig(format!(
                    "output directory {} does not exist",
                    self.directory.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `bytes` to `staging`, then move it to `target`. The staging file is
/// removed on any failure.
async fn write_atomically(staging: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let result = match tokio::fs::write(staging, bytes).await {
        Ok(()) => tokio::fs::rename(staging, target).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(staging).await;
    }
    result
}

/// Keep channel names usable as a file name component.
fn file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl DeliveryChannel for FileChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ChannelError> {
        self.ensure_directory().await?;

        let now = Utc::now();
        let bytes = self.encode(&Artifact {
            message,
            delivered_at: now,
        })?;

        let file_name = format!(
            "{}-{}-{}.{}",
            message.notification_id,
            file_component(&message.channel),
            now.timestamp_millis(),
            self.format.extension()
        );
        let target = self.directory.join(&file_name);
        let staging = self.directory.join(format!(".{}.tmp", file_name));

        write_atomically(&staging, &target, &bytes).await?;

        tracing::debug!(path = %target.display(), "Wrote notification artifact");

        Ok(DeliveryReceipt {
            detail: Some(target.display().to_string()),
        })
    }
}
