//! Destinations for deliveries that end in failure.
//!
//! Every terminal failure is reported to exactly one [`ErrorSink`]. The engine
//! defaults to a bounded [`DeadLetterQueue`] that can be inspected over the
//! API.

use crate::core::{DeliveryAttempt, FailureKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// A terminally failed delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDelivery {
    pub attempt: DeliveryAttempt,
    pub kind: FailureKind,
    pub topic: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedDelivery {
    pub fn new(attempt: DeliveryAttempt, kind: FailureKind, topic: impl Into<String>) -> Self {
        Self {
            attempt,
            kind,
            topic: topic.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Receives terminal delivery failures. Must not block.
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: FailedDelivery);
}

/// Logs failures and keeps nothing.
#[derive(Debug, Default)]
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn report(&self, failure: FailedDelivery) {
        warn!(
            notification_id = %failure.attempt.notification_id,
            subscription_id = %failure.attempt.subscription_id,
            channel_id = %failure.attempt.channel_id,
            topic = %failure.topic,
            attempts = failure.attempt.attempt_count,
            kind = %failure.kind,
            error = failure.attempt.last_error.as_deref().unwrap_or(""),
            "Delivery failed"
        );
    }
}

/// Forwards failures to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelErrorSink {
    tx: mpsc::UnboundedSender<FailedDelivery>,
}

impl ChannelErrorSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FailedDelivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ErrorSink for ChannelErrorSink {
    fn report(&self, failure: FailedDelivery) {
        if self.tx.send(failure).is_err() {
            warn!("Error sink receiver dropped; failure not forwarded");
        }
    }
}

/// Keeps the most recent failures in memory, dropping the oldest.
#[derive(Debug)]
pub struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<FailedDelivery>>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<FailedDelivery> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl ErrorSink for DeadLetterQueue {
    fn report(&self, failure: FailedDelivery) {
        error!(
            notification_id = %failure.attempt.notification_id,
            subscription_id = %failure.attempt.subscription_id,
            channel_id = %failure.attempt.channel_id,
            topic = %failure.topic,
            attempts = failure.attempt.attempt_count,
            kind = %failure.kind,
            error = failure.attempt.last_error.as_deref().unwrap_or(""),
            "Delivery dead-lettered"
        );
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(failure);
    }
}
