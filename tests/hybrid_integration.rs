/// Hybrid Event Bus Integration Tests
///
/// These tests drive the hybrid bus through an in-process broker that can be
/// taken offline and brought back:
/// - Degraded startup and recovery
/// - Correlation-id de-duplication across transports
/// - History round trips
/// - Delivery across instances
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hybrid_eventbus::event_bus::{
    BusMode, HistorySource, HybridBus, HybridConfig, MemoryBroker, PublishOptions, RemoteConfig,
    SubscribeOptions,
};
use hybrid_eventbus::{Event, EventHandler, EventKind};
use tokio::sync::mpsc;

/// Test helper: hybrid config with fast retries and a short health check interval
fn hybrid_config(health_check_interval: Duration) -> HybridConfig {
    HybridConfig {
        enable_remote: true,
        fallback_to_local: true,
        remote: Some(RemoteConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            ..RemoteConfig::default()
        }),
        health_check_interval,
        ..HybridConfig::default()
    }
}

/// Test helper: handler that counts invocations
fn counting(counter: Arc<AtomicUsize>) -> impl EventHandler {
    move |_event: Event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        }
    }
}

/// Test helper: handler that forwards events into a channel
fn forwarding(tx: mpsc::UnboundedSender<Event>) -> impl EventHandler {
    move |event: Event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            Ok::<_, anyhow::Error>(())
        }
    }
}

async fn wait_for_mode(bus: &HybridBus, mode: BusMode, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if bus.mode().await == mode {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_degraded_startup_delivers_locally() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false).await;

    let bus = HybridBus::with_broker(hybrid_config(Duration::from_secs(30)), Arc::new(broker)).unwrap();
    bus.start().await.unwrap();

    let stats = bus.get_stats().await;
    assert_eq!(stats.mode, BusMode::LocalOnly);

    let counter = Arc::new(AtomicUsize::new(0));
    let ids = bus
        .subscribe(EventKind::BOOKING_CREATED, counting(counter.clone()), SubscribeOptions::default())
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let report = bus
        .publish(
            Event::new(EventKind::BOOKING_CREATED, "user-1", "org-1"),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.local.map(|d| d.handlers), Some(1));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recovery_on_next_health_tick() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false).await;

    let bus = HybridBus::with_broker(
        hybrid_config(Duration::from_millis(50)),
        Arc::new(broker.clone()),
    )
    .unwrap();
    bus.start().await.unwrap();
    assert_eq!(bus.mode().await, BusMode::LocalOnly);

    let counter = Arc::new(AtomicUsize::new(0));
    bus.subscribe("location.created", counting(counter.clone()), SubscribeOptions::default())
        .await
        .unwrap();

    broker.set_reachable(true).await;
    assert!(wait_for_mode(&bus, BusMode::Hybrid, Duration::from_secs(2)).await);

    // The registration made while degraded still receives events
    bus.publish(Event::new("location.created", "u", "o"), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    broker.set_reachable(false).await;
    assert!(wait_for_mode(&bus, BusMode::LocalOnly, Duration::from_secs(2)).await);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_same_correlation_id_yields_one_history_entry() {
    let broker = MemoryBroker::new();
    let bus = HybridBus::with_broker(hybrid_config(Duration::from_secs(30)), Arc::new(broker)).unwrap();
    bus.start().await.unwrap();

    let event = Event::new(EventKind::BOOKING_CREATED, "user-1", "org-1").with_correlation_id("abc-1");
    bus.publish(event.clone(), PublishOptions::default()).await.unwrap();
    bus.publish(event, PublishOptions::default()).await.unwrap();

    let history = bus.get_event_history(None, 100, HistorySource::Both).await;
    let matching: Vec<_> = history.iter().filter(|e| e.correlation_id == "abc-1").collect();
    assert_eq!(matching.len(), 1);
}

#[tokio::test]
async fn test_history_round_trip() {
    let broker = MemoryBroker::new();
    let bus = HybridBus::with_broker(hybrid_config(Duration::from_secs(30)), Arc::new(broker)).unwrap();
    bus.start().await.unwrap();

    let k = 12;
    let base = chrono::Utc::now();
    for i in 0..k {
        let kind = if i % 3 == 0 { EventKind::USER_CREATED } else { EventKind::USER_UPDATED };
        bus.publish(
            Event::new(kind, "u", "o")
                .with_correlation_id(format!("evt-{}", i))
                .with_timestamp(base + chrono::Duration::milliseconds(i as i64)),
            PublishOptions::default(),
        )
        .await
        .unwrap();
    }

    for source in [HistorySource::Local, HistorySource::Remote, HistorySource::Both] {
        let history = bus.get_event_history(None, k + 5, source).await;
        assert_eq!(history.len(), k, "source {:?}", source);

        let unique: HashSet<_> = history.iter().map(|e| e.correlation_id.clone()).collect();
        assert_eq!(unique.len(), k);
        assert!(history.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    let limited = bus.get_event_history(Some(EventKind::USER_CREATED), 2, HistorySource::Both).await;
    let ids: Vec<_> = limited.iter().map(|e| e.correlation_id.as_str()).collect();
    assert_eq!(ids, vec!["evt-9", "evt-6"]);
}

#[tokio::test]
async fn test_events_cross_instances() {
    let hub = MemoryBroker::new();
    let producer = HybridBus::with_broker(hybrid_config(Duration::from_secs(30)), Arc::new(hub.clone())).unwrap();
    let consumer = HybridBus::with_broker(hybrid_config(Duration::from_secs(30)), Arc::new(hub.peer())).unwrap();
    producer.start().await.unwrap();
    consumer.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .subscribe(EventKind::LOCATION_UPDATED, forwarding(tx), SubscribeOptions::remote_only())
        .await
        .unwrap();

    producer
        .publish(
            Event::new(EventKind::LOCATION_UPDATED, "u", "o").with_correlation_id("loc-1"),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event should cross instances")
        .expect("channel open");
    assert_eq!(received.correlation_id, "loc-1");

    // Local-only publishes stay in the producer's process
    producer
        .publish(Event::new(EventKind::LOCATION_UPDATED, "u", "o"), PublishOptions::local_only())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_no_ordering_across_concurrent_publishers() {
    let broker = MemoryBroker::new();
    let bus = HybridBus::with_broker(hybrid_config(Duration::from_secs(30)), Arc::new(broker)).unwrap();
    bus.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe("x", forwarding(tx), SubscribeOptions::local_only())
        .await
        .unwrap();

    let publishers: Vec<_> = (0..2)
        .map(|p| {
            let bus = bus.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    bus.publish(
                        Event::new("x", "u", "o").with_correlation_id(format!("p{}-{}", p, i)),
                        PublishOptions::default(),
                    )
                    .await
                    .unwrap();
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.await.unwrap();
    }

    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        received.push(event.correlation_id);
    }

    // Every event arrives exactly once; only per-publisher order is observable
    assert_eq!(received.len(), 20);
    assert_eq!(received.iter().collect::<HashSet<_>>().len(), 20);
    for p in 0..2 {
        let prefix = format!("p{}-", p);
        let own: Vec<_> = received.iter().filter(|id| id.starts_with(&prefix)).collect();
        let expected: Vec<_> = (0..10).map(|i| format!("p{}-{}", p, i)).collect();
        assert_eq!(own, expected.iter().collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_handler_failure_reported_as_system_error() {
    let broker = MemoryBroker::new();
    let bus = HybridBus::with_broker(hybrid_config(Duration::from_secs(30)), Arc::new(broker)).unwrap();
    bus.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(EventKind::SYSTEM_ERROR, forwarding(tx), SubscribeOptions::local_only())
        .await
        .unwrap();

    async fn failing(_event: Event) -> anyhow::Result<()> {
        anyhow::bail!("booking store offline")
    }
    let healthy = Arc::new(AtomicUsize::new(0));
    bus.subscribe(EventKind::BOOKING_CREATED, failing, SubscribeOptions::local_only())
        .await
        .unwrap();
    bus.subscribe(EventKind::BOOKING_CREATED, counting(healthy.clone()), SubscribeOptions::local_only())
        .await
        .unwrap();

    let report = bus
        .publish(
            Event::new(EventKind::BOOKING_CREATED, "u", "o").with_correlation_id("b-1"),
            PublishOptions::local_only(),
        )
        .await
        .unwrap();
    let delivery = report.local.expect("local leg");
    assert_eq!(delivery.handlers, 2);
    assert_eq!(delivery.failures.len(), 1);
    assert_eq!(healthy.load(Ordering::SeqCst), 1);

    let error = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("system.error should be published")
        .expect("channel open");
    assert!(error.is_error_event());
    match error.metadata.payload {
        hybrid_eventbus::EventPayload::SystemError(data) => {
            assert_eq!(data.original_correlation_id, "b-1");
            assert!(data.message.contains("booking store offline"));
        }
        other => panic!("Expected SystemError payload, got {:?}", other),
    }
}
