//! Core domain types and service traits for notifyd
//!
//! This module defines the data model shared by every component of the
//! dispatch engine (notifications, subscriptions, deliveries and their
//! attempts) and the trait contract outbound transports implement.

use crate::error::SendError;
use crate::filter::Filter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Free-form string attributes attached to a notification. Filters are
/// evaluated against these, never against the opaque payload.
pub type Metadata = BTreeMap<String, String>;

/// Unique identifier for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a delivery channel, as named in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A published notification. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub topic: String,
    /// Opaque payload; serialization is the producer's concern.
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: NotificationId::new(),
            topic: topic.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Adds a metadata attribute.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replaces all metadata at once.
    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A topic subscription routing matching notifications to one channel.
///
/// The embedded cancellation token is cancelled when the subscription is
/// removed, which stops queued and scheduled deliveries made on its behalf.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub filter: Filter,
    pub channel: ChannelId,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, filter: Filter, channel: ChannelId) -> Self {
        Self {
            id: SubscriptionId::new(),
            topic: topic.into(),
            filter,
            channel,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether the subscription is still registered.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Token handed to every delivery created for this subscription.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Lifecycle state of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Failed)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why an attempt ended in [`DeliveryState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The sender classified the failure as non-retryable.
    Permanent,
    /// Every allowed attempt failed transiently.
    Exhausted,
    /// The subscription was removed before the attempt could run.
    Unsubscribed,
    /// Discarded while the engine was tearing down.
    Shutdown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Permanent => "permanent",
            FailureKind::Exhausted => "exhausted",
            FailureKind::Unsubscribed => "unsubscribed",
            FailureKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one notification's delivery towards one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub notification_id: NotificationId,
    pub subscription_id: SubscriptionId,
    pub channel_id: ChannelId,
    /// Number of sends performed so far.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub state: DeliveryState,
}

/// A unit of work travelling through a channel queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub notification: Arc<Notification>,
    pub subscription_id: SubscriptionId,
    pub channel_id: ChannelId,
    /// Number of sends performed so far; bumped by the worker before sending.
    pub attempt: u32,
    pub(crate) cancel: CancellationToken,
}

impl Delivery {
    pub fn new(notification: Arc<Notification>, subscription: &Subscription) -> Self {
        Self {
            notification,
            subscription_id: subscription.id,
            channel_id: subscription.channel.clone(),
            attempt: 0,
            cancel: subscription.cancellation(),
        }
    }

    /// True once the owning subscription has been removed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn notification_id(&self) -> NotificationId {
        self.notification.id
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// Outbound transport for a single channel.
///
/// Receivers are expected to deduplicate on the notification id: a delivery
/// can be sent more than once when an acknowledgement is lost.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Short transport name ("webhook", "log"), used in logs and metrics.
    fn kind(&self) -> &'static str;

    /// Performs one send of `delivery`.
    ///
    /// # Returns
    /// * `Ok(())` when the receiver acknowledged the delivery
    /// * `Err(SendError::Transient)` when a retry may succeed
    /// * `Err(SendError::Permanent)` when retrying is pointless
    async fn send(&self, delivery: &Delivery) -> Result<(), SendError>;
}

/// Read-only view of a registered channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub kind: String,
    pub backlog: usize,
    pub capacity: usize,
    pub workers: usize,
}
