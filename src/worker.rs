//! Channel workers: dequeue, send, classify, and hand off retries.

use crate::core::{ChannelId, ChannelSender, Delivery, FailureKind};
use crate::error::SendError;
use crate::queue::DeliveryQueue;
use crate::retry::{RetryHandle, RetryPolicy};
use crate::tracker::DeliveryTracker;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// Everything a worker needs to serve one channel.
pub struct WorkerContext {
    pub channel_id: ChannelId,
    pub sender: Arc<dyn ChannelSender>,
    pub queue: Arc<DeliveryQueue>,
    pub tracker: Arc<DeliveryTracker>,
    pub retries: RetryHandle,
    pub policy: RetryPolicy,
}

/// Serves a channel queue until shutdown is signalled or the queue closes.
#[instrument(skip_all, fields(channel_id = %ctx.channel_id, worker = index))]
pub async fn worker_loop(
    index: usize,
    ctx: Arc<WorkerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Channel worker started");
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|v| *v) => break,
            next = ctx.queue.dequeue() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        process(&ctx, delivery, &mut shutdown_rx).await;
    }
    info!("Channel worker stopped");
}

async fn process(
    ctx: &WorkerContext,
    mut delivery: Delivery,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let channel = ctx.channel_id.0.clone();

    if delivery.is_cancelled() {
        ctx.tracker
            .mark_failed(&delivery, FailureKind::Unsubscribed, None);
        complete(&channel, FailureKind::Unsubscribed.as_str());
        return;
    }

    delivery.attempt += 1;
    ctx.tracker.mark_in_flight(&delivery);
    metrics::counter!("delivery_attempts_total", "channel" => channel.clone()).increment(1);

    let started = Instant::now();
    let result = tokio::select! {
        biased;
        _ = shutdown_rx.wait_for(|v| *v) => None,
        result = ctx.sender.send(&delivery) => Some(result),
    };
    metrics::histogram!("send_duration_seconds", "channel" => channel.clone())
        .record(started.elapsed().as_secs_f64());

    let Some(result) = result else {
        ctx.tracker.mark_failed(
            &delivery,
            FailureKind::Shutdown,
            Some("send aborted by shutdown".to_string()),
        );
        complete(&channel, FailureKind::Shutdown.as_str());
        return;
    };

    match result {
        Ok(()) => {
            ctx.tracker.mark_delivered(&delivery);
            complete(&channel, "delivered");
        }
        Err(SendError::Permanent(error)) => {
            ctx.tracker
                .mark_failed(&delivery, FailureKind::Permanent, Some(error));
            complete(&channel, FailureKind::Permanent.as_str());
        }
        Err(SendError::Transient(error)) => {
            on_transient(ctx, delivery, error, &channel);
        }
    }
}

fn on_transient(ctx: &WorkerContext, delivery: Delivery, error: String, channel: &str) {
    if delivery.is_cancelled() {
        ctx.tracker
            .mark_failed(&delivery, FailureKind::Unsubscribed, Some(error));
        complete(channel, FailureKind::Unsubscribed.as_str());
        return;
    }
    if !ctx.policy.should_retry(delivery.attempt) {
        ctx.tracker
            .mark_failed(&delivery, FailureKind::Exhausted, Some(error));
        complete(channel, FailureKind::Exhausted.as_str());
        return;
    }

    let delay = ctx.policy.backoff_for(delivery.attempt);
    ctx.tracker.mark_retrying(&delivery, &error, delay);
    metrics::counter!("delivery_retries_total", "channel" => channel.to_string()).increment(1);

    if let Err(delivery) = ctx.retries.schedule(delivery, delay) {
        debug!(
            notification_id = %delivery.notification_id(),
            "Retry scheduler gone, dropping delivery"
        );
        ctx.tracker
            .mark_failed(&delivery, FailureKind::Shutdown, Some(error));
        complete(channel, FailureKind::Shutdown.as_str());
    }
}

fn complete(channel: &str, outcome: &'static str) {
    metrics::counter!(
        "deliveries_completed_total",
        "channel" => channel.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
