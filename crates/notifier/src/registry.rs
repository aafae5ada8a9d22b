//! Channel configuration and the name → channel registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    ChannelError, ConsoleChannel, DeliveryChannel, FileChannel, FileFormat, WebhookChannel,
    WebhookConfig,
};

/// Declarative configuration for one named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    Console {
        name: String,
    },
    File {
        name: String,
        directory: PathBuf,
        #[serde(default)]
        format: FileFormat,
    },
    Webhook {
        name: String,
        #[serde(flatten)]
        config: WebhookConfig,
    },
}

impl ChannelConfig {
    pub fn name(&self) -> &str {
        match self {
            ChannelConfig::Console { name }
            | ChannelConfig::File { name, .. }
            | ChannelConfig::Webhook { name, .. } => name,
        }
    }

    pub fn build(&self) -> Result<Arc<dyn DeliveryChannel>, ChannelError> {
        let channel: Arc<dyn DeliveryChannel> = match self {
            ChannelConfig::Console { name } => Arc::new(ConsoleChannel::new(name.clone())),
            ChannelConfig::File {
                name,
                directory,
                format,
            } => Arc::new(FileChannel::new(name.clone(), directory.clone(), *format)),
            ChannelConfig::Webhook { name, config } => {
                Arc::new(WebhookChannel::new(name.clone(), config.clone())?)
            }
        };
        Ok(channel)
    }

    /// Parse a JSON array of channel configurations.
    pub fn parse_list(json: &str) -> Result<Vec<ChannelConfig>, ChannelError> {
        serde_json::from_str(json).map_err(|e| ChannelError::InvalidConfig(e.to_string()))
    }

    /// Configuration used when nothing is configured: a single console channel.
    pub fn defaults() -> Vec<ChannelConfig> {
        vec![ChannelConfig::Console {
            name: "console".to_string(),
        }]
    }
}

/// Configured channels, looked up by name.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn DeliveryChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured channel. Duplicate names are rejected.
    pub fn from_configs(configs: &[ChannelConfig]) -> Result<Self, ChannelError> {
        let mut registry = Self::new();
        for config in configs {
            if registry.contains(config.name()) {
                return Err(ChannelError::InvalidConfig(format!(
                    "channel '{}' configured more than once",
                    config.name()
                )));
            }
            registry.register(config.build()?);
        }
        Ok(registry)
    }

    /// Add a channel, replacing any channel with the same name.
    pub fn register(&mut self, channel: Arc<dyn DeliveryChannel>) {
        tracing::info!(channel = channel.name(), kind = channel.kind(), "Registered channel");
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeliveryChannel>> {
        self.channels.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Registered channel names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channel_list() {
        let configs = ChannelConfig::parse_list(
            r#"[
                {"type": "console", "name": "console"},
                {"type": "file", "name": "archive", "directory": "/var/lib/courier", "format": "yaml"},
                {"type": "webhook", "name": "ops-hook", "url": "https://hooks.example.com/x",
                 "auth": {"type": "bearer", "token": "abc"}}
            ]"#,
        )
        .unwrap();

        assert_eq!(configs.len(), 3);
        assert_eq!(configs[1].name(), "archive");
        match &configs[1] {
            ChannelConfig::File { format, .. } => assert_eq!(*format, FileFormat::Yaml),
            other => panic!("unexpected config: {other:?}"),
        }
        match &configs[2] {
            ChannelConfig::Webhook { config, .. } => {
                assert_eq!(config.method, "POST");
                assert_eq!(config.timeout_secs, 30);
            }
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = ChannelConfig::parse_list(r#"[{"type": "pager", "name": "p"}]"#).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidConfig(_)));
    }

    #[test]
    fn test_registry_from_configs() {
        let registry = ChannelRegistry::from_configs(&[
            ChannelConfig::Console {
                name: "console".to_string(),
            },
            ChannelConfig::File {
                name: "archive".to_string(),
                directory: PathBuf::from("/tmp"),
                format: FileFormat::Json,
            },
        ])
        .unwrap();

        assert_eq!(registry.names(), vec!["archive", "console"]);
        assert_eq!(registry.get("archive").unwrap().kind(), "file");
        assert!(registry.get("email").is_none());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let configs = vec![
            ChannelConfig::Console {
                name: "console".to_string(),
            },
            ChannelConfig::Console {
                name: "console".to_string(),
            },
        ];
        assert!(ChannelRegistry::from_configs(&configs).is_err());
    }

    #[test]
    fn test_defaults_are_console_only() {
        let registry = ChannelRegistry::from_configs(&ChannelConfig::defaults()).unwrap();
        assert_eq!(registry.names(), vec!["console"]);
    }
}
