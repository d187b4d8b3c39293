//! Error types for the dispatch engine.

use crate::core::{ChannelId, SubscriptionId};
use thiserror::Error;

/// Errors returned by the engine before a delivery is attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    /// The channel's queue is at capacity. The caller must back off or shed.
    #[error("delivery queue for channel {0} is full")]
    QueueFull(ChannelId),

    #[error("engine is shutting down")]
    ShutdownInProgress,

    #[error("topic must not be empty")]
    InvalidTopic,

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("channel registered twice: {0}")]
    DuplicateChannel(ChannelId),
}

impl EngineError {
    /// True for both flavours of "unknown id".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::SubscriptionNotFound(_) | EngineError::ChannelNotFound(_)
        )
    }
}

/// Failure reported by a [`ChannelSender`](crate::core::ChannelSender).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Retryable: timeouts, connection resets, remote overload.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Terminal: malformed payload, auth rejected. Never retried.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }

    /// The message without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            SendError::Transient(msg) | SendError::Permanent(msg) => msg,
        }
    }
}
