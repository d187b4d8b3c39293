//! Built-in channel transports and their configuration.

pub mod log;
pub mod webhook;

use crate::core::{ChannelId, ChannelSender};
use crate::engine::ChannelOptions;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A `[[channels]]` entry in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Webhook(webhook::WebhookConfig),
    Log(log::LogChannelConfig),
}

impl ChannelConfig {
    pub fn id(&self) -> ChannelId {
        match self {
            ChannelConfig::Webhook(c) => c.id.clone(),
            ChannelConfig::Log(c) => c.id.clone(),
        }
    }

    /// Overrides of the engine-wide queue and worker settings.
    pub fn options(&self) -> ChannelOptions {
        let (queue_capacity, workers) = match self {
            ChannelConfig::Webhook(c) => (c.queue_capacity, c.workers),
            ChannelConfig::Log(c) => (c.queue_capacity, c.workers),
        };
        ChannelOptions {
            queue_capacity,
            workers,
        }
    }

    /// Builds the transport for this channel.
    pub fn build_sender(&self) -> anyhow::Result<Arc<dyn ChannelSender>> {
        Ok(match self {
            ChannelConfig::Webhook(c) => Arc::new(webhook::WebhookSender::new(c)?),
            ChannelConfig::Log(c) => Arc::new(log::LogSender::new(c.level)),
        })
    }
}
