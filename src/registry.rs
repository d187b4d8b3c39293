//! The subscription registry.
//!
//! Holds every live subscription, indexed both by id and by topic so that
//! matching a notification only visits the subscribers of its topic.

use crate::core::{ChannelId, Notification, Subscription, SubscriptionId};
use crate::error::EngineError;
use crate::filter::Filter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct RegistryInner {
    by_topic: HashMap<String, Vec<Arc<Subscription>>>,
    by_id: HashMap<SubscriptionId, Arc<Subscription>>,
}

/// Topic → subscriber mappings with an owned lifecycle.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription and returns its id.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        filter: Filter,
        channel: ChannelId,
    ) -> SubscriptionId {
        let subscription = Arc::new(Subscription::new(topic, filter, channel));
        let id = subscription.id;

        let mut inner = self.inner.write();
        inner
            .by_topic
            .entry(subscription.topic.clone())
            .or_default()
            .push(subscription.clone());
        info!(
            subscription_id = %id,
            topic = %subscription.topic,
            channel_id = %subscription.channel,
            "Subscription added"
        );
        inner.by_id.insert(id, subscription);
        id
    }

    /// Removes a subscription and cancels its outstanding deliveries.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<Arc<Subscription>, EngineError> {
        let mut inner = self.inner.write();
        let subscription = inner
            .by_id
            .remove(&id)
            .ok_or(EngineError::SubscriptionNotFound(id))?;

        if let Some(bucket) = inner.by_topic.get_mut(&subscription.topic) {
            bucket.retain(|s| s.id != id);
            if bucket.is_empty() {
                inner.by_topic.remove(&subscription.topic);
            }
        }
        drop(inner);

        subscription.cancel();
        info!(
            subscription_id = %id,
            topic = %subscription.topic,
            channel_id = %subscription.channel,
            "Subscription removed"
        );
        Ok(subscription)
    }

    /// Returns every subscription on the notification's topic whose filter
    /// accepts it.
    pub fn match_notification(&self, notification: &Notification) -> Vec<Arc<Subscription>> {
        let inner = self.inner.read();
        let Some(bucket) = inner.by_topic.get(&notification.topic) else {
            return Vec::new();
        };
        let matched: Vec<_> = bucket
            .iter()
            .filter(|s| s.filter.matches(&notification.metadata))
            .cloned()
            .collect();
        debug!(
            notification_id = %notification.id,
            topic = %notification.topic,
            candidates = bucket.len(),
            matched = matched.len(),
            "Matched notification against registry"
        );
        matched
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    /// All subscriptions, ordered by topic.
    pub fn list(&self) -> Vec<Arc<Subscription>> {
        let inner = self.inner.read();
        let mut all: Vec<_> = inner.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.read().by_topic.len()
    }
}
