//! A channel that writes deliveries to the application log.
//!
//! Useful for debugging subscriptions and as an audit trail; it never fails.

use crate::core::{ChannelId, ChannelSender, Delivery};
use crate::error::SendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChannelConfig {
    pub id: ChannelId,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub workers: Option<usize>,
}

#[derive(Debug, Default)]
pub struct LogSender {
    level: LogLevel,
}

impl LogSender {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

#[async_trait]
impl ChannelSender for LogSender {
    fn kind(&self) -> &'static str {
        "log"
    }

    async fn send(&self, delivery: &Delivery) -> Result<(), SendError> {
        let n = &delivery.notification;
        let payload = String::from_utf8_lossy(&n.payload);
        match self.level {
            LogLevel::Debug => debug!(
                notification_id = %n.id,
                topic = %n.topic,
                channel_id = %delivery.channel_id,
                metadata = ?n.metadata,
                payload = %payload,
                "Notification received"
            ),
            LogLevel::Info => info!(
                notification_id = %n.id,
                topic = %n.topic,
                channel_id = %delivery.channel_id,
                metadata = ?n.metadata,
                payload = %payload,
                "Notification received"
            ),
            LogLevel::Warn => warn!(
                notification_id = %n.id,
                topic = %n.topic,
                channel_id = %delivery.channel_id,
                metadata = ?n.metadata,
                payload = %payload,
                "Notification received"
            ),
        }
        Ok(())
    }
}
