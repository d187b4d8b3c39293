//! # Internal Metrics Module
//!
//! Installs the Prometheus recorder and registers descriptions for every
//! metric the engine emits. Call sites use the `metrics` macros directly;
//! when no recorder is installed those calls are no-ops.
//!
//! The rendered exposition is served by the HTTP API under `/metrics`.

use anyhow::{Context, Result};
use metrics::Unit;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Registers descriptions for all supported metrics with the global recorder.
pub fn describe_metrics() {
    metrics::describe_counter!("notifications_published_total", Unit::Count, "Total number of notifications accepted by publish.");
    metrics::describe_counter!("deliveries_enqueued_total", Unit::Count, "Deliveries placed on a channel queue, labeled by channel.");
    metrics::describe_counter!("deliveries_rejected_total", Unit::Count, "Deliveries that could not be queued, labeled by channel and reason.");
    metrics::describe_counter!("delivery_attempts_total", Unit::Count, "Sends performed by channel workers, labeled by channel.");
    metrics::describe_counter!("delivery_retries_total", Unit::Count, "Transient failures that were scheduled for another attempt.");
    metrics::describe_counter!("deliveries_completed_total", Unit::Count, "Deliveries that reached a terminal state, labeled by channel and outcome.");
    metrics::describe_gauge!("delivery_queue_backlog", Unit::Count, "Deliveries currently waiting in a channel queue.");
    metrics::describe_histogram!(
        "send_duration_seconds",
        Unit::Seconds,
        "The time in seconds a single channel send takes."
    );
}

/// Installs the global Prometheus recorder and returns a handle that renders
/// the current exposition. Fails if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    describe_metrics();
    Ok(handle)
}

/// Builds a recorder without installing it globally. Used by tests that
/// want a handle to render without touching process-wide state.
pub fn standalone_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}
