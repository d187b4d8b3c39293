//! Per-notification delivery bookkeeping.
//!
//! The tracker owns the authoritative [`DeliveryAttempt`] for every
//! (notification, subscription) pair that is still being worked on. A
//! notification is forgotten as soon as all of its attempts are terminal.

use crate::core::{
    Delivery, DeliveryAttempt, DeliveryState, FailureKind, Notification, NotificationId,
    SubscriptionId,
};
use crate::sink::{ErrorSink, FailedDelivery};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

/// Emitted on every terminal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
    pub attempt: DeliveryAttempt,
    /// `None` when the delivery succeeded.
    pub failure: Option<FailureKind>,
}

impl DeliveryEvent {
    pub fn is_delivered(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub outstanding: usize,
    pub retained_notifications: usize,
    pub delivered: u64,
    pub failed: u64,
}

struct TrackedNotification {
    notification: Arc<Notification>,
    attempts: HashMap<SubscriptionId, DeliveryAttempt>,
}

pub struct DeliveryTracker {
    records: Mutex<HashMap<NotificationId, TrackedNotification>>,
    outstanding: AtomicUsize,
    delivered: AtomicU64,
    failed: AtomicU64,
    shutdown_failures: AtomicUsize,
    idle: Notify,
    events: broadcast::Sender<DeliveryEvent>,
    sink: Arc<dyn ErrorSink>,
}

impl DeliveryTracker {
    pub fn new(sink: Arc<dyn ErrorSink>, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            records: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            shutdown_failures: AtomicUsize::new(0),
            idle: Notify::new(),
            events,
            sink,
        }
    }

    /// Starts tracking a delivery that is about to be queued.
    pub fn begin(&self, delivery: &Delivery) {
        let attempt = DeliveryAttempt {
            notification_id: delivery.notification_id(),
            subscription_id: delivery.subscription_id,
            channel_id: delivery.channel_id.clone(),
            attempt_count: delivery.attempt,
            last_error: None,
            state: DeliveryState::Pending,
        };
        let mut records = self.records.lock();
        records
            .entry(delivery.notification_id())
            .or_insert_with(|| TrackedNotification {
                notification: delivery.notification.clone(),
                attempts: HashMap::new(),
            })
            .attempts
            .insert(delivery.subscription_id, attempt);
        drop(records);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        debug!(
            notification_id = %delivery.notification_id(),
            subscription_id = %delivery.subscription_id,
            channel_id = %delivery.channel_id,
            attempt = delivery.attempt,
            state = %DeliveryState::Pending,
            "Delivery pending"
        );
    }

    /// Forgets a delivery that was rejected before it was ever queued.
    pub fn discard(&self, delivery: &Delivery) {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&delivery.notification_id()) else {
            return;
        };
        if record.attempts.remove(&delivery.subscription_id).is_none() {
            return;
        }
        if record.attempts.values().all(|a| a.state.is_terminal()) {
            records.remove(&delivery.notification_id());
        }
        drop(records);
        self.release();
    }

    pub fn mark_in_flight(&self, delivery: &Delivery) {
        self.update(delivery, |attempt| {
            attempt.state = DeliveryState::InFlight;
            attempt.attempt_count = delivery.attempt;
        });
        debug!(
            notification_id = %delivery.notification_id(),
            subscription_id = %delivery.subscription_id,
            channel_id = %delivery.channel_id,
            attempt = delivery.attempt,
            "Delivery in flight"
        );
    }

    /// Records a transient failure that will be retried after `delay`.
    pub fn mark_retrying(&self, delivery: &Delivery, error: &str, delay: Duration) {
        self.update(delivery, |attempt| {
            attempt.state = DeliveryState::Pending;
            attempt.attempt_count = delivery.attempt;
            attempt.last_error = Some(error.to_string());
        });
        warn!(
            notification_id = %delivery.notification_id(),
            subscription_id = %delivery.subscription_id,
            channel_id = %delivery.channel_id,
            attempt = delivery.attempt,
            retry_in_ms = delay.as_millis() as u64,
            error,
            "Delivery failed transiently, retry scheduled"
        );
    }

    pub fn mark_delivered(&self, delivery: &Delivery) {
        let Some(attempt) = self.finish(delivery, DeliveryState::Delivered, None) else {
            return;
        };
        info!(
            notification_id = %attempt.notification_id,
            subscription_id = %attempt.subscription_id,
            channel_id = %attempt.channel_id,
            attempt = attempt.attempt_count,
            state = %attempt.state,
            "Delivery succeeded"
        );
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.emit(DeliveryEvent {
            attempt,
            failure: None,
        });
    }

    /// Records a terminal failure and reports it to the error sink.
    pub fn mark_failed(&self, delivery: &Delivery, kind: FailureKind, error: Option<String>) {
        let Some(attempt) = self.finish(delivery, DeliveryState::Failed, error) else {
            return;
        };
        info!(
            notification_id = %attempt.notification_id,
            subscription_id = %attempt.subscription_id,
            channel_id = %attempt.channel_id,
            attempt = attempt.attempt_count,
            state = %attempt.state,
            kind = %kind,
            error = attempt.last_error.as_deref().unwrap_or(""),
            "Delivery failed"
        );
        self.failed.fetch_add(1, Ordering::Relaxed);
        if kind == FailureKind::Shutdown {
            self.shutdown_failures.fetch_add(1, Ordering::SeqCst);
        }
        self.sink.report(FailedDelivery::new(
            attempt.clone(),
            kind,
            delivery.notification.topic.clone(),
        ));
        self.emit(DeliveryEvent {
            attempt,
            failure: Some(kind),
        });
    }

    /// Snapshot of every attempt of a notification that is still retained.
    pub fn attempts(&self, id: NotificationId) -> Option<Vec<DeliveryAttempt>> {
        let records = self.records.lock();
        let record = records.get(&id)?;
        let mut attempts: Vec<_> = record.attempts.values().cloned().collect();
        attempts.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        Some(attempts)
    }

    /// The retained notification itself, if it still has open deliveries.
    pub fn notification(&self, id: NotificationId) -> Option<Arc<Notification>> {
        self.records.lock().get(&id).map(|r| r.notification.clone())
    }

    /// Number of notifications with at least one non-terminal delivery.
    pub fn retained(&self) -> usize {
        self.records.lock().len()
    }

    /// Number of deliveries not yet in a terminal state.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Deliveries failed with [`FailureKind::Shutdown`] so far.
    pub fn shutdown_failures(&self) -> usize {
        self.shutdown_failures.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            outstanding: self.outstanding(),
            retained_notifications: self.retained(),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Resolves once no delivery is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    fn update(&self, delivery: &Delivery, f: impl FnOnce(&mut DeliveryAttempt)) {
        let mut records = self.records.lock();
        if let Some(attempt) = records
            .get_mut(&delivery.notification_id())
            .and_then(|r| r.attempts.get_mut(&delivery.subscription_id))
            .filter(|a| !a.state.is_terminal())
        {
            f(attempt);
        }
    }

    /// Moves an attempt to a terminal state. Returns `None` if it was
    /// already terminal or unknown, so each delivery finishes once.
    fn finish(
        &self,
        delivery: &Delivery,
        state: DeliveryState,
        error: Option<String>,
    ) -> Option<DeliveryAttempt> {
        let mut records = self.records.lock();
        let record = records.get_mut(&delivery.notification_id())?;
        let attempt = record.attempts.get_mut(&delivery.subscription_id)?;
        if attempt.state.is_terminal() {
            return None;
        }
        attempt.state = state;
        attempt.attempt_count = delivery.attempt;
        if error.is_some() {
            attempt.last_error = error;
        }
        let snapshot = attempt.clone();

        if record.attempts.values().all(|a| a.state.is_terminal()) {
            records.remove(&delivery.notification_id());
        }
        drop(records);

        self.release();
        Some(snapshot)
    }

    fn release(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn emit(&self, event: DeliveryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}
