#![allow(dead_code)]

pub mod senders;

use notifyd::engine::EngineConfig;
use notifyd::tracker::DeliveryEvent;
use notifyd::RetryPolicy;
use std::time::Duration;
use tokio::sync::broadcast;

/// Engine settings with fast, jitter-free retries.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        queue_capacity: 64,
        workers_per_channel: 1,
        shutdown_timeout_ms: 2_000,
        requeue_delay_ms: 10,
        event_buffer: 256,
        dead_letter_capacity: 100,
        retry: RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            jitter_ms: 0,
        },
    }
}

/// Collects `n` terminal delivery events, failing the test after five seconds.
pub async fn wait_for_events(
    events: &mut broadcast::Receiver<DeliveryEvent>,
    n: usize,
) -> Vec<DeliveryEvent> {
    let mut collected = Vec::with_capacity(n);
    tokio::time::timeout(Duration::from_secs(5), async {
        while collected.len() < n {
            match events.recv().await {
                Ok(event) => collected.push(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .expect("timed out waiting for delivery events");
    collected
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
