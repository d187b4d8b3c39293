//! Fan-out of published notifications to per-channel queues.

use crate::core::{ChannelId, Delivery, Notification, NotificationId, SubscriptionId};
use crate::error::EngineError;
use crate::queue::DeliveryQueue;
use crate::registry::SubscriptionRegistry;
use crate::tracker::DeliveryTracker;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one matching subscription during a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOutcome {
    pub subscription_id: SubscriptionId,
    pub channel_id: ChannelId,
    pub result: Result<(), EngineError>,
}

/// Result of a publish: one outcome per matching subscription.
///
/// A notification that matches nothing yields an empty report, which is a
/// success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub notification_id: NotificationId,
    pub outcomes: Vec<ChannelOutcome>,
}

impl PublishReport {
    pub fn accepted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn rejected(&self) -> impl Iterator<Item = &ChannelOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn is_fully_accepted(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// JSON-friendly view of the report.
    pub fn summary(&self) -> PublishSummary {
        PublishSummary {
            notification_id: self.notification_id,
            matched: self.outcomes.len(),
            accepted: self.accepted(),
            rejected: self
                .rejected()
                .map(|o| RejectedChannel {
                    subscription_id: o.subscription_id,
                    channel_id: o.channel_id.clone(),
                    error: o
                        .result
                        .as_ref()
                        .err()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishSummary {
    pub notification_id: NotificationId,
    pub matched: usize,
    pub accepted: usize,
    pub rejected: Vec<RejectedChannel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedChannel {
    pub subscription_id: SubscriptionId,
    pub channel_id: ChannelId,
    pub error: String,
}

/// Resolves subscribers and enqueues one delivery per match.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    queues: Arc<HashMap<ChannelId, Arc<DeliveryQueue>>>,
    tracker: Arc<DeliveryTracker>,
    accepting: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        queues: Arc<HashMap<ChannelId, Arc<DeliveryQueue>>>,
        tracker: Arc<DeliveryTracker>,
    ) -> Self {
        Self {
            registry,
            queues,
            tracker,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Publishes a notification to every matching subscription.
    ///
    /// Never waits on a queue or a send. A full channel queue is reported in
    /// that channel's outcome and does not affect the others.
    pub fn publish(&self, notification: Notification) -> Result<PublishReport, EngineError> {
        if !self.is_accepting() {
            return Err(EngineError::ShutdownInProgress);
        }
        if notification.topic.is_empty() {
            return Err(EngineError::InvalidTopic);
        }

        let notification = Arc::new(notification);
        metrics::counter!("notifications_published_total").increment(1);

        let matched = self.registry.match_notification(&notification);
        let mut outcomes = Vec::with_capacity(matched.len());
        for subscription in matched {
            let delivery = Delivery::new(notification.clone(), &subscription);
            let channel = subscription.channel.clone();
            let result = self.enqueue(delivery);
            if let Err(e) = &result {
                warn!(
                    notification_id = %notification.id,
                    subscription_id = %subscription.id,
                    channel_id = %channel,
                    error = %e,
                    "Delivery rejected"
                );
            }
            outcomes.push(ChannelOutcome {
                subscription_id: subscription.id,
                channel_id: channel,
                result,
            });
        }

        debug!(
            notification_id = %notification.id,
            topic = %notification.topic,
            matched = outcomes.len(),
            "Notification dispatched"
        );
        Ok(PublishReport {
            notification_id: notification.id,
            outcomes,
        })
    }

    fn enqueue(&self, delivery: Delivery) -> Result<(), EngineError> {
        let channel = delivery.channel_id.clone();
        let Some(queue) = self.queues.get(&channel) else {
            return Err(EngineError::ChannelNotFound(channel));
        };

        self.tracker.begin(&delivery);
        match queue.enqueue(delivery) {
            Ok(()) => {
                metrics::counter!("deliveries_enqueued_total", "channel" => channel.0).increment(1);
                Ok(())
            }
            Err(e) => {
                let error = e.to_engine_error();
                let reason = match error {
                    EngineError::QueueFull(_) => "queue_full",
                    _ => "closed",
                };
                self.tracker.discard(e.delivery());
                metrics::counter!(
                    "deliveries_rejected_total",
                    "channel" => channel.0,
                    "reason" => reason
                )
                .increment(1);
                Err(error)
            }
        }
    }

    /// Stops accepting publishes. Returns false if already stopped.
    pub fn stop_accepting(&self) -> bool {
        self.accepting.swap(false, Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}
