//! The dispatch engine: owns the registry, the channel queues and workers,
//! the retry scheduler and the delivery tracker, and exposes the public
//! publish / subscribe / shutdown surface.

use crate::core::{
    ChannelId, ChannelInfo, ChannelSender, DeliveryAttempt, FailureKind, Notification,
    NotificationId, SubscriptionId,
};
use crate::dispatcher::{Dispatcher, PublishReport};
use crate::error::EngineError;
use crate::filter::{Filter, FilterSpec};
use crate::queue::DeliveryQueue;
use crate::registry::SubscriptionRegistry;
use crate::retry::{RetryHandle, RetryPolicy, RetryScheduler};
use crate::sink::{DeadLetterQueue, ErrorSink, FailedDelivery};
use crate::task_manager::TaskManager;
use crate::tracker::{DeliveryEvent, DeliveryTracker, TrackerStats};
use crate::worker::{worker_loop, WorkerContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Engine tuning knobs. Channel-level overrides live in [`ChannelOptions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default capacity of each channel queue.
    pub queue_capacity: usize,
    /// Default number of concurrent workers per channel. With one worker,
    /// deliveries on a channel are sent in enqueue order.
    pub workers_per_channel: usize,
    /// How long `shutdown` waits for outstanding deliveries.
    pub shutdown_timeout_ms: u64,
    /// Delay before a retry that found its queue full tries again.
    pub requeue_delay_ms: u64,
    /// Capacity of the delivery event broadcast.
    pub event_buffer: usize,
    /// Entries kept by the default dead-letter sink.
    pub dead_letter_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers_per_channel: 1,
            shutdown_timeout_ms: 10_000,
            requeue_delay_ms: 250,
            event_buffer: 1024,
            dead_letter_capacity: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-channel overrides of the engine defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub queue_capacity: Option<usize>,
    pub workers: Option<usize>,
}

/// Outcome of [`Engine::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// The drain deadline passed with deliveries still outstanding.
    pub timed_out: bool,
    /// Deliveries this shutdown failed with [`FailureKind::Shutdown`].
    pub discarded: usize,
}

/// Read-only view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub topic: String,
    pub channel: ChannelId,
    pub filter: FilterSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineHealth {
    pub accepting: bool,
    pub subscriptions: usize,
    pub channels: usize,
    #[serde(flatten)]
    pub deliveries: TrackerStats,
}

struct ChannelEntry {
    id: ChannelId,
    sender: Arc<dyn ChannelSender>,
    queue: Arc<DeliveryQueue>,
    workers: usize,
}

pub struct EngineBuilder {
    config: EngineConfig,
    channels: Vec<(ChannelId, Arc<dyn ChannelSender>, ChannelOptions)>,
    sink: Option<Arc<dyn ErrorSink>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            channels: Vec::new(),
            sink: None,
        }
    }

    /// Registers a channel with the engine defaults.
    pub fn channel(self, id: impl Into<ChannelId>, sender: Arc<dyn ChannelSender>) -> Self {
        self.channel_with(id, sender, ChannelOptions::default())
    }

    pub fn channel_with(
        mut self,
        id: impl Into<ChannelId>,
        sender: Arc<dyn ChannelSender>,
        options: ChannelOptions,
    ) -> Self {
        self.channels.push((id.into(), sender, options));
        self
    }

    /// Replaces the default dead-letter sink.
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the engine and spawns its workers. Must be called from within
    /// a Tokio runtime.
    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;

        let mut entries: Vec<ChannelEntry> = Vec::with_capacity(self.channels.len());
        for (id, sender, options) in self.channels {
            if entries.iter().any(|e| e.id == id) {
                return Err(EngineError::DuplicateChannel(id));
            }
            let capacity = options.queue_capacity.unwrap_or(config.queue_capacity);
            entries.push(ChannelEntry {
                queue: Arc::new(DeliveryQueue::new(id.clone(), capacity)),
                workers: options.workers.unwrap_or(config.workers_per_channel).max(1),
                id,
                sender,
            });
        }

        let queues: Arc<HashMap<_, _>> = Arc::new(
            entries
                .iter()
                .map(|e| (e.id.clone(), e.queue.clone()))
                .collect(),
        );

        let (sink, dead_letters) = match self.sink {
            Some(sink) => (sink, None),
            None => {
                let dlq = Arc::new(DeadLetterQueue::new(config.dead_letter_capacity));
                let sink: Arc<dyn ErrorSink> = dlq.clone();
                (sink, Some(dlq))
            }
        };
        let tracker = Arc::new(DeliveryTracker::new(sink, config.event_buffer));
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone(), queues.clone(), tracker.clone());

        let tasks = TaskManager::new();
        let (scheduler, retries) = RetryScheduler::new(
            queues.clone(),
            tracker.clone(),
            Duration::from_millis(config.requeue_delay_ms.max(1)),
        );
        tasks.spawn("retry-scheduler", scheduler.run(tasks.shutdown_signal()));

        for entry in &entries {
            let ctx = Arc::new(WorkerContext {
                channel_id: entry.id.clone(),
                sender: entry.sender.clone(),
                queue: entry.queue.clone(),
                tracker: tracker.clone(),
                retries: retries.clone(),
                policy: config.retry.clone(),
            });
            for index in 0..entry.workers {
                tasks.spawn(
                    format!("worker-{}-{}", entry.id, index),
                    worker_loop(index, ctx.clone(), tasks.shutdown_signal()),
                );
            }
            info!(
                channel_id = %entry.id,
                kind = entry.sender.kind(),
                capacity = entry.queue.capacity(),
                workers = entry.workers,
                "Channel registered"
            );
        }

        Ok(Engine {
            config,
            registry,
            dispatcher,
            channels: entries,
            tracker,
            retries,
            tasks,
            dead_letters,
            shutdown: tokio::sync::Mutex::new(None),
        })
    }
}

/// A running notification dispatch engine.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    channels: Vec<ChannelEntry>,
    tracker: Arc<DeliveryTracker>,
    retries: RetryHandle,
    tasks: TaskManager,
    dead_letters: Option<Arc<DeadLetterQueue>>,
    shutdown: tokio::sync::Mutex<Option<ShutdownReport>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Publishes a payload with no metadata.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<PublishReport, EngineError> {
        self.publish_notification(Notification::new(topic, payload))
    }

    pub fn publish_notification(
        &self,
        notification: Notification,
    ) -> Result<PublishReport, EngineError> {
        self.dispatcher.publish(notification)
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        filter: Filter,
        channel: impl Into<ChannelId>,
    ) -> Result<SubscriptionId, EngineError> {
        if !self.dispatcher.is_accepting() {
            return Err(EngineError::ShutdownInProgress);
        }
        let topic = topic.into();
        if topic.is_empty() {
            return Err(EngineError::InvalidTopic);
        }
        let channel = channel.into();
        if !self.channels.iter().any(|c| c.id == channel) {
            return Err(EngineError::ChannelNotFound(channel));
        }
        Ok(self.registry.subscribe(topic, filter, channel))
    }

    /// Removes a subscription. Its queued and scheduled deliveries fail as
    /// [`FailureKind::Unsubscribed`]; a send already in flight finishes.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), EngineError> {
        self.registry.unsubscribe(id)?;
        self.retries.cancel(id);
        Ok(())
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.registry.get(id).map(|s| SubscriptionInfo {
            id: s.id,
            topic: s.topic.clone(),
            channel: s.channel.clone(),
            filter: s.filter.spec().clone(),
        })
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry
            .list()
            .into_iter()
            .map(|s| SubscriptionInfo {
                id: s.id,
                topic: s.topic.clone(),
                channel: s.channel.clone(),
                filter: s.filter.spec().clone(),
            })
            .collect()
    }

    /// Registered channels in registration order.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.channels
            .iter()
            .map(|c| ChannelInfo {
                id: c.id.clone(),
                kind: c.sender.kind().to_string(),
                backlog: c.queue.backlog(),
                capacity: c.queue.capacity(),
                workers: c.workers,
            })
            .collect()
    }

    /// Attempts of a notification that still has open deliveries.
    pub fn attempts(&self, id: NotificationId) -> Option<Vec<DeliveryAttempt>> {
        self.tracker.attempts(id)
    }

    /// Stream of terminal delivery transitions.
    pub fn events(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.tracker.subscribe_events()
    }

    /// Contents of the default dead-letter sink; empty when a custom sink
    /// was configured.
    pub fn dead_letters(&self) -> Vec<FailedDelivery> {
        self.dead_letters
            .as_ref()
            .map(|d| d.entries())
            .unwrap_or_default()
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            accepting: self.dispatcher.is_accepting(),
            subscriptions: self.registry.len(),
            channels: self.channels.len(),
            deliveries: self.tracker.stats(),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.dispatcher.is_accepting()
    }

    /// Stops accepting work, lets outstanding deliveries finish within the
    /// configured timeout, then stops every worker and fails what is left
    /// with [`FailureKind::Shutdown`].
    ///
    /// Safe to call more than once; later calls return the first report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut guard = self.shutdown.lock().await;
        if let Some(report) = *guard {
            return report;
        }

        self.dispatcher.stop_accepting();
        let failed_before = self.tracker.shutdown_failures();
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        info!(
            outstanding = self.tracker.outstanding(),
            timeout_ms = self.config.shutdown_timeout_ms,
            "Engine shutting down, draining deliveries"
        );

        let timed_out = tokio::time::timeout(timeout, self.tracker.wait_idle())
            .await
            .is_err();
        if timed_out {
            warn!(
                outstanding = self.tracker.outstanding(),
                "Drain deadline passed, discarding remaining deliveries"
            );
        }

        self.tasks.trigger_shutdown();
        self.tasks.join_all().await;

        for channel in &self.channels {
            channel.queue.close();
            while let Some(delivery) = channel.queue.try_dequeue() {
                self.tracker
                    .mark_failed(&delivery, FailureKind::Shutdown, None);
            }
        }

        let discarded = self.tracker.shutdown_failures() - failed_before;
        let report = ShutdownReport {
            timed_out,
            discarded,
        };
        info!(
            timed_out,
            discarded,
            delivered = self.tracker.stats().delivered,
            failed = self.tracker.stats().failed,
            "Engine stopped"
        );
        *guard = Some(report);
        report
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.tasks.trigger_shutdown();
    }
}
