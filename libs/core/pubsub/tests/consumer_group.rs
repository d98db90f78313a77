mod common;

use common::{Recorder, WAIT};
use pubsub::{
    handler_fn, BackoffStrategy, ConsumerGroupConfig, ConsumerGroupDriver, HealthStatus,
    MemoryLog, Message, MessageHandler, Messaging, PublishError, SubscribeError, TaskState,
    TransportError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_utils::eventually;

fn config(group: &str) -> ConsumerGroupConfig {
    ConsumerGroupConfig::new("memory://", group)
        .with_poll_interval(Duration::from_millis(10))
        .with_read_backoff(BackoffStrategy::Fixed(Duration::from_millis(10)))
        .with_drain_timeout(Duration::from_secs(1))
}

fn driver(log: &MemoryLog, config: ConsumerGroupConfig) -> ConsumerGroupDriver {
    ConsumerGroupDriver::with_transport(Arc::new(log.clone()), config)
}

async fn publish(driver: &ConsumerGroupDriver, topic: &str, body: &str) {
    driver
        .publish(&Message::new(topic, body).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delivers_every_message_on_every_topic() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    let recorder = Recorder::new();

    driver
        .subscribe_multiple(&["orders", "invoices"], recorder.clone())
        .await
        .unwrap();

    for body in ["o1", "o2", "o3"] {
        publish(&driver, "orders", body).await;
    }
    for body in ["i1", "i2"] {
        publish(&driver, "invoices", body).await;
    }

    assert!(eventually(WAIT, || recorder.count() == 5).await);
    assert_eq!(recorder.payloads("orders"), vec!["o1", "o2", "o3"]);
    assert_eq!(recorder.payloads("invoices"), vec!["i1", "i2"]);
    assert!(eventually(WAIT, || log.pending_count("orders", "billing") == 0).await);
    assert!(recorder.seen().iter().all(|d| !d.redelivered && d.message_id.is_some()));

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_group_starts_at_newest_message() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    publish(&driver, "orders", "before").await;

    let recorder = Recorder::new();
    driver.subscribe("orders", recorder.clone()).await.unwrap();
    publish(&driver, "orders", "after").await;

    assert!(eventually(WAIT, || recorder.count() == 1).await);
    assert_eq!(recorder.payloads("orders"), vec!["after"]);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_partial_subscribe_failure_keeps_other_topics() {
    let log = MemoryLog::new();
    log.reject_topic("invoices");
    let driver = driver(&log, config("billing"));
    let recorder = Recorder::new();

    let err = driver
        .subscribe_multiple(&["orders", "invoices"], recorder.clone())
        .await
        .unwrap_err();
    assert_eq!(err.attempted(), 2);
    assert_eq!(err.failed_topics(), vec!["invoices"]);
    assert!(matches!(err.failures()[0], SubscribeError::Transport { .. }));

    let topics: Vec<_> = driver.subscriptions().into_iter().map(|s| s.topic).collect();
    assert_eq!(topics, vec!["orders"]);

    publish(&driver, "orders", "still flowing").await;
    assert!(eventually(WAIT, || recorder.count() == 1).await);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_rejects_duplicates_and_bad_topics() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    let recorder = Recorder::new();

    driver.subscribe("orders", recorder.clone()).await.unwrap();
    let err = driver.subscribe("orders", recorder.clone()).await.unwrap_err();
    assert!(matches!(err, SubscribeError::AlreadySubscribed { .. }));

    let err = driver.subscribe("", recorder.clone()).await.unwrap_err();
    assert!(matches!(err, SubscribeError::InvalidTopic { .. }));

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_close_stops_delivery_and_rejects_new_work() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    let recorder = Recorder::new();
    driver.subscribe("orders", recorder.clone()).await.unwrap();

    driver.close().await.unwrap();
    assert!(driver.is_closed());
    assert!(driver
        .subscriptions()
        .iter()
        .all(|s| s.state == TaskState::Stopped));

    // Another instance keeps writing to the same log.
    let producer = self::driver(&log, config("producer"));
    publish(&producer, "orders", "late").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.count(), 0);

    let err = driver
        .publish(&Message::new("orders", "x").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Closed));

    let err = driver.subscribe("invoices", recorder.clone()).await.unwrap_err();
    assert!(matches!(err, SubscribeError::Closed { .. }));

    // Second close is a no-op.
    driver.close().await.unwrap();
    assert!(!driver.health_check(Duration::from_millis(100)).await.is_healthy());
}

#[tokio::test]
async fn test_failed_message_stays_pending() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing").with_consumer_id("worker-1"));
    let recorder = Recorder::rejecting("bad");
    driver.subscribe("orders", recorder.clone()).await.unwrap();

    publish(&driver, "orders", "bad").await;
    publish(&driver, "orders", "good").await;

    assert!(eventually(WAIT, || recorder.count() == 2).await);
    assert!(eventually(WAIT, || log.pending_count("orders", "billing") == 1).await);
    assert_eq!(log.pending_for("orders", "billing", "worker-1"), 1);

    // Not retried in-process.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.count(), 2);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_with_same_consumer_id_redelivers_pending() {
    let log = MemoryLog::new();
    let first = driver(&log, config("billing").with_consumer_id("worker-1"));
    let failing = Recorder::rejecting("order-42");
    first.subscribe("orders", failing.clone()).await.unwrap();

    publish(&first, "orders", "order-42").await;
    assert!(eventually(WAIT, || failing.count() == 1).await);
    first.close().await.unwrap();
    assert_eq!(log.pending_count("orders", "billing"), 1);

    let restarted = driver(&log, config("billing").with_consumer_id("worker-1"));
    let recorder = Recorder::new();
    restarted.subscribe("orders", recorder.clone()).await.unwrap();

    assert!(eventually(WAIT, || recorder.count() == 1).await);
    let delivered = &recorder.seen()[0];
    assert_eq!(delivered.payload, "order-42");
    assert!(delivered.redelivered);
    assert!(eventually(WAIT, || log.pending_count("orders", "billing") == 0).await);

    restarted.close().await.unwrap();
}

#[tokio::test]
async fn test_idle_message_is_claimed_by_another_member() {
    let log = MemoryLog::new();
    let first = driver(&log, config("billing").with_consumer_id("worker-1"));
    let failing = Recorder::rejecting("stuck");
    first.subscribe("orders", failing.clone()).await.unwrap();
    publish(&first, "orders", "stuck").await;
    assert!(eventually(WAIT, || failing.count() == 1).await);

    let second = driver(
        &log,
        config("billing")
            .with_consumer_id("worker-2")
            .with_claim_idle(Duration::from_millis(100))
            .with_claim_interval(Duration::from_millis(20)),
    );
    let recorder = Recorder::new();
    second.subscribe("orders", recorder.clone()).await.unwrap();

    assert!(eventually(WAIT, || recorder.count() == 1).await);
    assert!(recorder.seen()[0].redelivered);
    assert!(eventually(WAIT, || log.pending_count("orders", "billing") == 0).await);

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_members_share_work() {
    let log = MemoryLog::new();
    let a = driver(&log, config("billing").with_consumer_id("a"));
    let b = driver(&log, config("billing").with_consumer_id("b"));
    let seen_a = Recorder::new();
    let seen_b = Recorder::new();
    a.subscribe("orders", seen_a.clone()).await.unwrap();
    b.subscribe("orders", seen_b.clone()).await.unwrap();

    for i in 0..20 {
        publish(&a, "orders", &format!("m{i}")).await;
    }

    assert!(eventually(WAIT, || seen_a.count() + seen_b.count() == 20).await);
    let mut all: Vec<_> = seen_a
        .payloads("orders")
        .into_iter()
        .chain(seen_b.payloads("orders"))
        .collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 20);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_entry_is_skipped() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    let recorder = Recorder::new();
    driver.subscribe("orders", recorder.clone()).await.unwrap();

    log.append_undecodable("orders");
    publish(&driver, "orders", "fine").await;

    assert!(eventually(WAIT, || recorder.count() == 1).await);
    assert_eq!(recorder.payloads("orders"), vec!["fine"]);
    assert!(eventually(WAIT, || log.pending_count("orders", "billing") == 0).await);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_transient_read_errors_do_not_stop_delivery() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    let recorder = Recorder::new();
    driver.subscribe("orders", recorder.clone()).await.unwrap();

    log.inject_read_errors(
        "orders",
        (0..3).map(|i| TransportError::Transient(format!("connection reset {i}"))),
    );
    publish(&driver, "orders", "after-errors").await;

    assert!(eventually(WAIT, || recorder.count() == 1).await);
    assert_eq!(driver.health_check(Duration::from_secs(1)).await, HealthStatus::Healthy);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_group_is_recreated() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    let recorder = Recorder::new();
    driver.subscribe("orders", recorder.clone()).await.unwrap();

    log.destroy_groups("orders");
    tokio::time::sleep(Duration::from_millis(100)).await;
    publish(&driver, "orders", "after-recreate").await;

    assert!(eventually(WAIT, || recorder.count() == 1).await);
    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_fatal_read_error_is_reported_by_health() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    driver
        .subscribe_multiple(&["orders", "invoices"], Recorder::new())
        .await
        .unwrap();

    log.inject_read_errors("orders", [TransportError::Fatal("WRONGTYPE".to_string())]);

    let stopped = || {
        driver
            .subscriptions()
            .iter()
            .any(|s| s.topic == "orders" && s.state == TaskState::Stopped)
    };
    assert!(eventually(WAIT, stopped).await);

    match driver.health_check(Duration::from_secs(1)).await {
        HealthStatus::Unhealthy { reason } => assert!(reason.contains("orders"), "{reason}"),
        HealthStatus::Healthy => panic!("dead delivery task must make the driver unhealthy"),
    }

    // Subscribing again replaces the dead task and clears the failure.
    driver.subscribe("orders", Recorder::new()).await.unwrap();
    assert!(driver.health_check(Duration::from_secs(1)).await.is_healthy());

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_fatal_error_on_first_read_is_reported_by_health() {
    let log = MemoryLog::new();
    log.inject_read_errors("orders", [TransportError::Fatal("NOPERM".to_string())]);
    let driver = driver(&log, config("billing"));

    driver.subscribe("orders", Recorder::new()).await.unwrap();

    let stopped = || {
        driver
            .subscriptions()
            .iter()
            .any(|s| s.topic == "orders" && s.state == TaskState::Stopped)
    };
    assert!(eventually(WAIT, stopped).await);

    match driver.health_check(Duration::from_secs(1)).await {
        HealthStatus::Unhealthy { reason } => assert!(reason.contains("orders"), "{reason}"),
        HealthStatus::Healthy => panic!("task that died on its first read must be reported"),
    }

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_leaves_message_pending() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing").with_consumer_id("worker-1"));
    let recorder = Recorder::new();
    let inner = recorder.clone();
    let handler = Arc::new(handler_fn(move |ctx, msg: Message| {
        let inner = inner.clone();
        async move {
            if msg.payload() == b"boom" {
                panic!("cannot handle boom");
            }
            inner.handle(ctx, msg).await
        }
    }));
    driver.subscribe("orders", handler).await.unwrap();

    publish(&driver, "orders", "boom").await;
    publish(&driver, "orders", "after").await;

    assert!(eventually(WAIT, || recorder.count() == 1).await);
    assert_eq!(recorder.payloads("orders"), vec!["after"]);
    assert!(eventually(WAIT, || log.pending_count("orders", "billing") == 1).await);
    assert_eq!(log.pending_for("orders", "billing", "worker-1"), 1);
    assert!(driver.health_check(Duration::from_secs(1)).await.is_healthy());

    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_health_check_respects_deadline() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    assert!(driver.health_check(Duration::from_millis(200)).await.is_healthy());

    log.set_unresponsive(true);
    let started = Instant::now();
    let status = driver.health_check(Duration::from_millis(50)).await;
    assert!(!status.is_healthy());
    assert!(started.elapsed() < Duration::from_secs(1));

    // Probing never writes to the log.
    assert!(log.is_empty("orders"));
    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_close_waits_for_running_handler() {
    let log = MemoryLog::new();
    let driver = driver(&log, config("billing"));
    let recorder = Recorder::slow(Duration::from_millis(100));
    driver.subscribe("orders", recorder.clone()).await.unwrap();

    publish(&driver, "orders", "slow").await;
    // Let the task pick the message up.
    tokio::time::sleep(Duration::from_millis(40)).await;
    driver.close().await.unwrap();

    assert_eq!(recorder.count(), 1);
    assert_eq!(log.pending_count("orders", "billing"), 0);
}

#[tokio::test]
async fn test_close_gives_up_on_stuck_handler() {
    let log = MemoryLog::new();
    let driver = driver(
        &log,
        config("billing").with_drain_timeout(Duration::from_millis(50)),
    );
    let recorder = Recorder::slow(Duration::from_secs(30));
    driver.subscribe("orders", recorder.clone()).await.unwrap();

    publish(&driver, "orders", "stuck").await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let started = Instant::now();
    let err = driver.close().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.failures()[0].contains("orders"), "{err}");
    assert_eq!(log.pending_count("orders", "billing"), 1);
}

#[tokio::test]
async fn test_messaging_facade_forwards_to_consumer_group() {
    let log = MemoryLog::new();
    let messaging = Messaging::from(driver(&log, config("billing")));
    assert_eq!(messaging.backend(), pubsub::Backend::ConsumerGroup);

    let recorder = Recorder::new();
    messaging.subscribe("orders", recorder.clone()).await.unwrap();
    messaging
        .publish(
            "orders",
            b"{\"id\":1}".to_vec(),
            [("content-type".to_string(), "application/json".to_string())].into(),
        )
        .await
        .unwrap();

    assert!(eventually(WAIT, || recorder.count() == 1).await);
    let delivered = &recorder.seen()[0];
    assert_eq!(delivered.payload, "{\"id\":1}");
    assert_eq!(
        delivered.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );

    let err = messaging
        .publish("bad topic", b"x".to_vec(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::InvalidTopic(_)));

    messaging.close().await.unwrap();
    assert!(messaging.is_closed());
}
