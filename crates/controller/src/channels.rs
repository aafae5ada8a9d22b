use anyhow::Context;

use courier_common::config::AppConfig;
use courier_notifier::ChannelConfig;

/// Resolve the channel list: inline `COURIER_CHANNELS` JSON first, then
/// `COURIER_CHANNELS_FILE`, then a single console channel.
pub fn load_channel_configs(config: &AppConfig) -> anyhow::Result<Vec<ChannelConfig>> {
    if let Some(json) = &config.channels_json {
        return ChannelConfig::parse_list(json).context("invalid COURIER_CHANNELS");
    }

    if let Some(path) = &config.channels_file {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read channel file {}", path))?;
        return ChannelConfig::parse_list(&json)
            .with_context(|| format!("invalid channel file {}", path));
    }

    tracing::info!("No channels configured, using console");
    Ok(ChannelConfig::defaults())
}
