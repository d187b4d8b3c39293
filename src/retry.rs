//! Retry policy and the scheduler that re-queues deliveries after backoff.

use crate::core::{ChannelId, Delivery, FailureKind, NotificationId, SubscriptionId};
use crate::queue::{DeliveryQueue, EnqueueError};
use crate::tracker::DeliveryTracker;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

/// Longest delay the scheduler accepts. The timer wheel behind `DelayQueue`
/// tops out at roughly two years and panics beyond that.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How transient failures are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of sends allowed, first attempt included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound of the random delay added to each backoff.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Whether another send is allowed after `attempts_made` sends.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Exponential backoff after the given (1-based) attempt, without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(pow).min(max))
    }

    /// Backoff plus a random jitter in `0..=jitter_ms`, capped at
    /// [`MAX_RETRY_DELAY`].
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        self.base_backoff(attempt)
            .saturating_add(Duration::from_millis(jitter))
            .min(MAX_RETRY_DELAY)
    }
}

/// Cloneable handle used by workers and the engine to talk to the scheduler.
#[derive(Debug, Clone)]
pub struct RetryHandle {
    schedule_tx: mpsc::UnboundedSender<(Delivery, Duration)>,
    cancel_tx: mpsc::UnboundedSender<SubscriptionId>,
}

impl RetryHandle {
    /// Schedules `delivery` to re-enter its channel queue after `delay`.
    /// Hands the delivery back if the scheduler has stopped.
    pub fn schedule(&self, delivery: Delivery, delay: Duration) -> Result<(), Delivery> {
        self.schedule_tx
            .send((delivery, delay))
            .map_err(|e| e.0 .0)
    }

    /// Drops every pending retry belonging to a subscription.
    pub fn cancel(&self, subscription_id: SubscriptionId) {
        let _ = self.cancel_tx.send(subscription_id);
    }
}

/// Holds deliveries waiting out their backoff.
pub struct RetryScheduler {
    pending: DelayQueue<Delivery>,
    keys: HashMap<(NotificationId, SubscriptionId), delay_queue::Key>,
    schedule_rx: mpsc::UnboundedReceiver<(Delivery, Duration)>,
    cancel_rx: mpsc::UnboundedReceiver<SubscriptionId>,
    queues: Arc<HashMap<ChannelId, Arc<DeliveryQueue>>>,
    tracker: Arc<DeliveryTracker>,
    requeue_delay: Duration,
}

impl RetryScheduler {
    pub fn new(
        queues: Arc<HashMap<ChannelId, Arc<DeliveryQueue>>>,
        tracker: Arc<DeliveryTracker>,
        requeue_delay: Duration,
    ) -> (Self, RetryHandle) {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            pending: DelayQueue::new(),
            keys: HashMap::new(),
            schedule_rx,
            cancel_rx,
            queues,
            tracker,
            requeue_delay,
        };
        (
            scheduler,
            RetryHandle {
                schedule_tx,
                cancel_tx,
            },
        )
    }

    /// Runs until shutdown is signalled, then fails whatever is still waiting.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Retry scheduler started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.wait_for(|v| *v) => break,
                Some((delivery, delay)) = self.schedule_rx.recv() => {
                    self.insert(delivery, delay);
                }
                Some(subscription_id) = self.cancel_rx.recv() => {
                    self.cancel(subscription_id);
                }
                Some(expired) = self.pending.next(), if !self.pending.is_empty() => {
                    self.requeue(expired.into_inner());
                }
            }
        }
        self.drain();
        info!("Retry scheduler stopped");
    }

    fn insert(&mut self, delivery: Delivery, delay: Duration) {
        // The cancel request may have been processed before this schedule.
        if delivery.is_cancelled() {
            self.tracker
                .mark_failed(&delivery, FailureKind::Unsubscribed, None);
            return;
        }
        let key_id = (delivery.notification_id(), delivery.subscription_id);
        debug!(
            notification_id = %key_id.0,
            subscription_id = %key_id.1,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        let key = self.pending.insert(delivery, delay.min(MAX_RETRY_DELAY));
        self.keys.insert(key_id, key);
    }

    fn requeue(&mut self, delivery: Delivery) {
        self.keys
            .remove(&(delivery.notification_id(), delivery.subscription_id));

        if delivery.is_cancelled() {
            self.tracker
                .mark_failed(&delivery, FailureKind::Unsubscribed, None);
            return;
        }
        let Some(queue) = self.queues.get(&delivery.channel_id) else {
            let error = format!("unknown channel {}", delivery.channel_id);
            self.tracker
                .mark_failed(&delivery, FailureKind::Permanent, Some(error));
            return;
        };

        match queue.enqueue(delivery) {
            Ok(()) => {}
            Err(EnqueueError::Full(delivery)) => {
                warn!(
                    notification_id = %delivery.notification_id(),
                    channel_id = %delivery.channel_id,
                    "Queue full on retry, re-arming"
                );
                metrics::counter!(
                    "deliveries_rejected_total",
                    "channel" => delivery.channel_id.0.clone(),
                    "reason" => "retry_queue_full"
                )
                .increment(1);
                self.insert(delivery, self.requeue_delay);
            }
            Err(EnqueueError::Closed(delivery)) => {
                self.tracker
                    .mark_failed(&delivery, FailureKind::Shutdown, None);
            }
        }
    }

    fn cancel(&mut self, subscription_id: SubscriptionId) {
        let keys: Vec<_> = self
            .keys
            .keys()
            .filter(|(_, sub)| *sub == subscription_id)
            .copied()
            .collect();
        for key_id in keys {
            if let Some(key) = self.keys.remove(&key_id) {
                if let Some(expired) = self.pending.try_remove(&key) {
                    self.tracker.mark_failed(
                        &expired.into_inner(),
                        FailureKind::Unsubscribed,
                        None,
                    );
                }
            }
        }
    }

    fn drain(&mut self) {
        self.schedule_rx.close();
        while let Ok((delivery, _)) = self.schedule_rx.try_recv() {
            self.tracker
                .mark_failed(&delivery, FailureKind::Shutdown, None);
        }
        let discarded = self.keys.len();
        for (_, key) in self.keys.drain() {
            if let Some(expired) = self.pending.try_remove(&key) {
                self.tracker
                    .mark_failed(&expired.into_inner(), FailureKind::Shutdown, None);
            }
        }
        if discarded > 0 {
            warn!(discarded, "Pending retries discarded at shutdown");
        }
    }
}
