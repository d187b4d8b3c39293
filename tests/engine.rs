mod helpers;

use helpers::senders::{BlockingSender, RecordingSender, ScriptedSender};
use helpers::{eventually, fast_config, wait_for_events};
use notifyd::sink::ChannelErrorSink;
use notifyd::{
    Condition, DeliveryState, Engine, EngineError, FailureKind, Filter, FilterSpec, Notification,
    SendError,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_delivered_on_first_attempt() {
    let sender = Arc::new(RecordingSender::default());
    let engine = Engine::builder(fast_config())
        .channel("hook", sender.clone())
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();
    let mut events = engine.events();

    let report = engine.publish("orders", "order-1").unwrap();
    assert!(report.is_fully_accepted());
    assert_eq!(report.accepted(), 1);

    let events = wait_for_events(&mut events, 1).await;
    assert!(events[0].is_delivered());
    assert_eq!(events[0].attempt.attempt_count, 1);
    assert_eq!(events[0].attempt.state, DeliveryState::Delivered);
    assert_eq!(events[0].attempt.notification_id, report.notification_id);
    assert_eq!(sender.payloads(), vec!["order-1"]);

    // Fully terminal notifications are forgotten.
    assert!(engine.attempts(report.notification_id).is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_no_matching_subscription_is_empty_success() {
    let engine = Engine::builder(fast_config())
        .channel("hook", Arc::new(RecordingSender::default()))
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();

    let report = engine.publish("invoices", "ignored").unwrap();
    assert!(report.outcomes.is_empty());
    assert!(report.is_fully_accepted());
    assert_eq!(engine.health().deliveries.outstanding, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let sender = Arc::new(ScriptedSender::transient_times(3));
    let engine = Engine::builder(fast_config())
        .channel("hook", sender.clone())
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();
    let mut events = engine.events();

    engine.publish("orders", "order-1").unwrap();

    let events = wait_for_events(&mut events, 1).await;
    assert!(events[0].is_delivered());
    assert_eq!(events[0].attempt.attempt_count, 4);
    assert_eq!(sender.calls(), 4);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_reach_error_sink() {
    let mut config = fast_config();
    config.retry.max_attempts = 3;
    let sender = Arc::new(ScriptedSender::always_transient());
    let (sink, mut failures) = ChannelErrorSink::new();
    let engine = Engine::builder(config)
        .channel("hook", sender.clone())
        .error_sink(Arc::new(sink))
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();

    engine.publish("orders", "order-1").unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Exhausted);
    assert_eq!(failure.topic, "orders");
    assert_eq!(failure.attempt.attempt_count, 3);
    assert_eq!(failure.attempt.state, DeliveryState::Failed);
    assert!(failure.attempt.last_error.unwrap().contains("503"));
    assert_eq!(sender.calls(), 3);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let sender = Arc::new(ScriptedSender::new([Err(SendError::Permanent(
        "HTTP 400 Bad Request".into(),
    ))]));
    let (sink, mut failures) = ChannelErrorSink::new();
    let engine = Engine::builder(fast_config())
        .channel("hook", sender.clone())
        .error_sink(Arc::new(sink))
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();

    engine.publish("orders", "order-1").unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.attempt.attempt_count, 1);
    assert_eq!(sender.calls(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_backing_off_delivery_does_not_block_channel() {
    let mut config = fast_config();
    config.retry.initial_backoff_ms = 200;
    config.retry.max_backoff_ms = 200;
    let sender = Arc::new(ScriptedSender::transient_times(1));
    let engine = Engine::builder(config)
        .channel("hook", sender.clone())
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();
    let mut events = engine.events();

    let first = engine.publish("orders", "first").unwrap();
    let second = engine.publish("orders", "second").unwrap();

    let events = wait_for_events(&mut events, 2).await;
    assert_eq!(events[0].attempt.notification_id, second.notification_id);
    assert_eq!(events[1].attempt.notification_id, first.notification_id);
    assert_eq!(events[1].attempt.attempt_count, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_single_worker_preserves_order() {
    let sender = Arc::new(RecordingSender::default());
    let engine = Engine::builder(fast_config())
        .channel("hook", sender.clone())
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();
    let mut events = engine.events();

    let expected: Vec<String> = (0..20).map(|i| format!("order-{i}")).collect();
    for payload in &expected {
        engine.publish("orders", payload.as_str()).unwrap();
    }

    wait_for_events(&mut events, expected.len()).await;
    assert_eq!(sender.payloads(), expected);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_filter_selects_subscriptions_by_metadata() {
    let eu = Arc::new(RecordingSender::default());
    let us = Arc::new(RecordingSender::default());
    let engine = Engine::builder(fast_config())
        .channel("eu", eu.clone())
        .channel("us", us.clone())
        .build()
        .unwrap();
    let eu_filter = Filter::compile(FilterSpec {
        all: vec![Condition::one_of("region", ["eu-west", "eu-central"])],
        ..Default::default()
    })
    .unwrap();
    let us_filter = Filter::compile(FilterSpec {
        all: vec![Condition::regex("region", "^us-")],
        ..Default::default()
    })
    .unwrap();
    engine.subscribe("orders", eu_filter, "eu").unwrap();
    engine.subscribe("orders", us_filter, "us").unwrap();
    let mut events = engine.events();

    let report = engine
        .publish_notification(
            Notification::new("orders", "eu-order").with_metadata("region", "eu-west"),
        )
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].channel_id.as_str(), "eu");

    engine
        .publish_notification(
            Notification::new("orders", "us-order").with_metadata("region", "us-east"),
        )
        .unwrap();
    let unmatched = engine
        .publish_notification(Notification::new("orders", "no-region"))
        .unwrap();
    assert!(unmatched.outcomes.is_empty());

    wait_for_events(&mut events, 2).await;
    assert_eq!(eu.payloads(), vec!["eu-order"]);
    assert_eq!(us.payloads(), vec!["us-order"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_rejects_only_that_channel() {
    let slow = Arc::new(BlockingSender::default());
    let fast = Arc::new(RecordingSender::default());
    let engine = Engine::builder(fast_config())
        .channel_with(
            "slow",
            slow.clone(),
            notifyd::engine::ChannelOptions {
                queue_capacity: Some(1),
                workers: None,
            },
        )
        .channel("fast", fast.clone())
        .build()
        .unwrap();
    let slow_sub = engine
        .subscribe("orders", Filter::accept_all(), "slow")
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "fast")
        .unwrap();
    let mut events = engine.events();

    // First delivery occupies the slow worker, second fills its queue.
    assert!(engine.publish("orders", "1").unwrap().is_fully_accepted());
    eventually(|| slow.started() == 1).await;
    assert!(engine.publish("orders", "2").unwrap().is_fully_accepted());

    let report = engine.publish("orders", "3").unwrap();
    assert!(!report.is_fully_accepted());
    assert_eq!(report.accepted(), 1);
    let rejected: Vec<_> = report.rejected().collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].subscription_id, slow_sub);
    assert_eq!(
        rejected[0].result,
        Err(EngineError::QueueFull("slow".into()))
    );

    slow.release(2);
    let events = wait_for_events(&mut events, 5).await;
    assert!(events.iter().all(|e| e.is_delivered()));
    assert_eq!(fast.payloads(), vec!["1", "2", "3"]);
    assert_eq!(slow.finished(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_cancels_queued_deliveries() {
    let sender = Arc::new(BlockingSender::default());
    let (sink, mut failures) = ChannelErrorSink::new();
    let engine = Engine::builder(fast_config())
        .channel("hook", sender.clone())
        .error_sink(Arc::new(sink))
        .build()
        .unwrap();
    let sub = engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();
    let mut events = engine.events();

    for i in 0..3 {
        engine.publish("orders", format!("order-{i}")).unwrap();
    }
    eventually(|| sender.started() == 1).await;

    engine.unsubscribe(sub).unwrap();
    assert!(engine.subscription(sub).is_none());
    assert_eq!(
        engine.unsubscribe(sub),
        Err(EngineError::SubscriptionNotFound(sub))
    );
    sender.release(3);

    let events = wait_for_events(&mut events, 3).await;
    assert_eq!(events.iter().filter(|e| e.is_delivered()).count(), 1);
    for _ in 0..2 {
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.kind, FailureKind::Unsubscribed);
        assert_eq!(failure.attempt.subscription_id, sub);
    }
    // The in-flight send finished; the queued ones were never sent.
    assert_eq!(sender.started(), 1);

    // New notifications no longer match.
    assert!(engine.publish("orders", "late").unwrap().outcomes.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_cancels_scheduled_retries() {
    let mut config = fast_config();
    config.retry.initial_backoff_ms = 10_000;
    config.retry.max_backoff_ms = 10_000;
    let sender = Arc::new(ScriptedSender::always_transient());
    let (sink, mut failures) = ChannelErrorSink::new();
    let engine = Engine::builder(config)
        .channel("hook", sender.clone())
        .error_sink(Arc::new(sink))
        .build()
        .unwrap();
    let sub = engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();

    let report = engine.publish("orders", "order-1").unwrap();
    eventually(|| sender.calls() == 1).await;
    eventually(|| {
        engine
            .attempts(report.notification_id)
            .is_some_and(|a| a[0].state == DeliveryState::Pending)
    })
    .await;

    engine.unsubscribe(sub).unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Unsubscribed);
    assert_eq!(failure.attempt.attempt_count, 1);
    assert_eq!(sender.calls(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_drains_backlog() {
    let sender = Arc::new(RecordingSender::with_delay(Duration::from_millis(10)));
    let engine = Engine::builder(fast_config())
        .channel("hook", sender.clone())
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();

    for i in 0..5 {
        engine.publish("orders", format!("order-{i}")).unwrap();
    }

    let report = engine.shutdown().await;
    assert!(!report.timed_out);
    assert_eq!(report.discarded, 0);
    assert_eq!(sender.payloads().len(), 5);
    assert_eq!(engine.health().deliveries.delivered, 5);
    assert!(engine.dead_letters().is_empty());

    assert_eq!(
        engine.publish("orders", "late").unwrap_err(),
        EngineError::ShutdownInProgress
    );
}

#[tokio::test]
async fn test_shutdown_deadline_discards_outstanding() {
    let mut config = fast_config();
    config.shutdown_timeout_ms = 100;
    let sender = Arc::new(BlockingSender::default());
    let engine = Engine::builder(config)
        .channel("hook", sender.clone())
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();

    for i in 0..3 {
        engine.publish("orders", format!("order-{i}")).unwrap();
    }
    eventually(|| sender.started() == 1).await;

    let report = engine.shutdown().await;
    assert!(report.timed_out);
    assert_eq!(report.discarded, 3);

    let dead = engine.dead_letters();
    assert_eq!(dead.len(), 3);
    assert!(dead.iter().all(|d| d.kind == FailureKind::Shutdown));
    assert_eq!(sender.finished(), 0);
    assert_eq!(engine.health().deliveries.outstanding, 0);
}

#[tokio::test]
async fn test_invalid_topic_and_unknown_channel() {
    let engine = Engine::builder(fast_config())
        .channel("hook", Arc::new(RecordingSender::default()))
        .build()
        .unwrap();
    assert_eq!(
        engine.publish("", "payload").unwrap_err(),
        EngineError::InvalidTopic
    );
    assert_eq!(
        engine.subscribe("orders", Filter::accept_all(), "nowhere"),
        Err(EngineError::ChannelNotFound("nowhere".into()))
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn test_out_of_range_backoff_still_reaches_a_terminal_state() {
    let mut config = fast_config();
    config.shutdown_timeout_ms = 100;
    config.retry.initial_backoff_ms = 100_000_000_000;
    config.retry.max_backoff_ms = 100_000_000_000;
    let stuck = Arc::new(BlockingSender::default());
    let flaky = Arc::new(ScriptedSender::transient_times(1));
    let engine = Engine::builder(config)
        .channel("stuck", stuck.clone())
        .channel("flaky", flaky.clone())
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "stuck")
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "flaky")
        .unwrap();
    let mut events = engine.events();

    // The first flaky delivery parks in the scheduler, the second succeeds.
    engine.publish("orders", "order-1").unwrap();
    engine.publish("orders", "order-2").unwrap();
    let delivered = wait_for_events(&mut events, 1).await;
    assert!(delivered[0].is_delivered());
    assert_eq!(flaky.calls(), 2);
    eventually(|| stuck.started() == 1).await;

    // One parked retry, one in-flight send and one queued delivery.
    let report = engine.shutdown().await;
    assert!(report.timed_out);
    assert_eq!(report.discarded, 3);

    let dead = engine.dead_letters();
    assert_eq!(dead.len(), 3);
    assert!(dead.iter().all(|d| d.kind == FailureKind::Shutdown));
    assert_eq!(
        dead.iter()
            .filter(|d| d.attempt.channel_id.as_str() == "flaky")
            .count(),
        1
    );
    assert_eq!(engine.health().deliveries.outstanding, 0);
}

#[tokio::test]
async fn test_shutdown_report_ignores_work_finished_during_drain() {
    let sender = Arc::new(RecordingSender::with_delay(Duration::from_millis(20)));
    let engine = Engine::builder(fast_config())
        .channel("hook", sender.clone())
        .build()
        .unwrap();
    engine
        .subscribe("orders", Filter::accept_all(), "hook")
        .unwrap();
    for i in 0..3 {
        engine.publish("orders", format!("order-{i}")).unwrap();
    }

    let report = engine.shutdown().await;
    assert!(!report.timed_out);
    assert_eq!(report.discarded, 0);
    assert_eq!(sender.payloads().len(), 3);
}
