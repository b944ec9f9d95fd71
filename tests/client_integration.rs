//! End-to-end tests against an in-process STOMP broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use realtime_relay::{
    ConnectionState, Error, HeartbeatConfig, ParsedUpdate, RealtimeClient, ReconnectPolicy,
    SharedContext, Update, topics,
};
use serde_json::{Value, json};

use common::{FakeBroker, eventually, init_tracing, within};

// ============================================================================
// Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy::new()
        .with_initial_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(100))
}

fn client_for(broker: &FakeBroker) -> RealtimeClient {
    RealtimeClient::builder()
        .endpoint(broker.endpoint())
        .token("test-token")
        .reconnect(fast_reconnect())
        .build()
        .expect("client")
}

type Seen = Arc<Mutex<Vec<Value>>>;

fn recorder() -> (Seen, impl Fn(&Update) + Send + Sync + 'static) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |update: &Update| sink.lock().push(update.body.clone()))
}

// ============================================================================
// Connect
// ============================================================================

#[tokio::test]
async fn test_connect_sends_token_and_reaches_connected() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);

    within(client.connect()).await?;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(broker.request_uris(), vec!["/ws?access_token=test-token"]);

    // Idempotent while connected
    within(client.connect()).await?;
    assert_eq!(broker.connect_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_connect_shares_one_handshake() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    broker.set_handshake_delay(Duration::from_millis(200));
    let client = client_for(&broker);

    let (first, second) = within(async { tokio::join!(client.connect(), client.connect()) }).await;

    first?;
    second?;
    assert_eq!(broker.connect_count(), 1);
    assert!(client.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_connect_shares_one_failure() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    broker.set_reject(true);
    broker.set_handshake_delay(Duration::from_millis(100));
    let client = client_for(&broker);
    let _kept = client.subscribe(topics::ORDERS, |_| {});

    let (first, second) = within(async { tokio::join!(client.connect(), client.connect()) }).await;

    for result in [first, second] {
        let Err(Error::Connect(cause)) = result else {
            panic!("expected shared connect failure");
        };
        assert!(matches!(*cause, Error::Handshake { .. }));
    }
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.subscription_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_connect_timeout() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    broker.set_handshake_delay(Duration::from_secs(2));
    let client = RealtimeClient::builder()
        .endpoint(broker.endpoint())
        .connect_timeout(Duration::from_millis(150))
        .build()?;

    let err = within(client.connect()).await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_aborts_in_flight_connect() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    broker.set_handshake_delay(Duration::from_millis(300));
    let client = client_for(&broker);

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    assert!(eventually(WAIT, || broker.connect_count() == 1).await);

    client.disconnect();
    let result = within(connecting).await?;

    assert!(matches!(result, Err(Error::Connect(ref cause)) if matches!(**cause, Error::Disconnected)));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // The abandoned handshake never becomes a live session
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(eventually(WAIT, || broker.session_count() == 0).await);
    Ok(())
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_subscriptions_before_connect_receive_after_connect() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);

    let (seen_a, callback_a) = recorder();
    let (seen_b, callback_b) = recorder();
    let _a = client.subscribe(topics::ORDERS, callback_a);
    let _b = client.subscribe(topics::ORDERS, callback_b);

    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(1).await);

    assert_eq!(broker.publish(topics::ORDERS, r#"{"entity":"ORDER","id":7}"#), 1);

    assert!(eventually(WAIT, || seen_a.lock().len() == 1 && seen_b.lock().len() == 1).await);
    assert_eq!(seen_a.lock()[0], json!({ "entity": "ORDER", "id": 7 }));
    Ok(())
}

#[tokio::test]
async fn test_one_transport_subscription_per_topic() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);

    for _ in 0..3 {
        let _ = client.subscribe(topics::ORDERS, |_| {});
    }
    let _ = client.subscribe(topics::STAGES, |_| {});

    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(2).await);

    // Joining an attached topic adds no SUBSCRIBE; a new topic adds one
    let _ = client.subscribe(topics::STAGES, |_| {});
    let _ = client.subscribe(topics::DEFECTS, |_| {});
    assert!(broker.wait_for_subscriptions(3).await);

    let destinations: Vec<String> = broker.subscribes().into_iter().map(|(_, d)| d).collect();
    assert_eq!(destinations.len(), 3);
    assert_eq!(client.topic_count(), 3);
    assert_eq!(client.subscription_count(), 6);
    Ok(())
}

#[tokio::test]
async fn test_unsubscribe_stops_only_that_callback() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);
    within(client.connect()).await?;

    let (seen_c, callback_c) = recorder();
    let (seen_d, callback_d) = recorder();
    let c = client.subscribe("/topic/t", callback_c);
    let _d = client.subscribe("/topic/t", callback_d);
    assert!(broker.wait_for_subscriptions(1).await);

    assert!(c.unsubscribe());
    broker.publish("/topic/t", r#"{"n":1}"#);

    assert!(eventually(WAIT, || seen_d.lock().len() == 1).await);
    assert!(seen_c.lock().is_empty());
    assert!(broker.unsubscribes().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_last_unsubscribe_detaches_topic() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);
    within(client.connect()).await?;

    let only = client.subscribe(topics::DEFECTS, |_| {});
    assert!(broker.wait_for_subscriptions(1).await);
    let (id, _) = broker.subscribes()[0].clone();

    assert!(only.unsubscribe());

    assert!(broker.wait_for_subscriptions(0).await);
    assert_eq!(broker.unsubscribes(), vec![id]);
    assert_eq!(client.topic_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_fan_out_in_registration_order() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);

    let order = Arc::new(Mutex::new(Vec::new()));
    let a = Arc::clone(&order);
    let _a = client.subscribe(topics::STAGES, move |_| a.lock().push("A"));
    let b = Arc::clone(&order);
    let _b = client.subscribe(topics::STAGES, move |_| b.lock().push("B"));

    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(1).await);
    broker.publish(topics::STAGES, r#"{"entity":"STAGE","id":3}"#);

    assert!(eventually(WAIT, || order.lock().len() == 2).await);
    assert_eq!(*order.lock(), vec!["A", "B"]);
    Ok(())
}

#[tokio::test]
async fn test_order_update_decoded() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);

    let parsed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&parsed);
    let _a = client.subscribe(topics::ORDERS, move |update| sink.lock().push(update.parse()));

    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(1).await);
    broker.publish(topics::ORDERS, r#"{"entity":"ORDER","id":7}"#);

    assert!(eventually(WAIT, || parsed.lock().len() == 1).await);
    assert_eq!(parsed.lock()[0], ParsedUpdate::Order { id: Some(7) });
    Ok(())
}

#[tokio::test]
async fn test_malformed_payload_does_not_break_stream() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);
    let (seen, callback) = recorder();
    let _sub = client.subscribe("/topic/t", callback);

    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(1).await);

    broker.publish("/topic/t", "{not json");
    broker.publish("/topic/t", r#"{"ok":true}"#);

    assert!(eventually(WAIT, || seen.lock().len() == 1).await);
    assert!(client.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_panicking_callback_is_isolated() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);
    let _bad = client.subscribe("/topic/t", |_| panic!("consumer bug"));
    let (seen, callback) = recorder();
    let _good = client.subscribe("/topic/t", callback);

    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(1).await);
    broker.publish("/topic/t", "{}");
    broker.publish("/topic/t", "{}");

    assert!(eventually(WAIT, || seen.lock().len() == 2).await);
    assert!(client.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_oversized_content_length_is_dropped() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);
    let (seen, callback) = recorder();
    let _sub = client.subscribe("/topic/t", callback);

    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(1).await);

    let oversized = format!(
        "MESSAGE\ndestination:/topic/t\ncontent-length:{}\n\n\0",
        usize::MAX
    );
    assert_eq!(broker.push_raw(&oversized), 1);
    broker.publish("/topic/t", r#"{"ok":true}"#);

    assert!(eventually(WAIT, || seen.lock().len() == 1).await);
    assert!(client.is_connected());
    assert_eq!(broker.connect_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_publish_round_trip() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);
    let (seen, callback) = recorder();
    let _sub = client.subscribe("/topic/echo", callback);

    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(1).await);

    client.publish("/topic/echo", &json!({ "entity": "STAGE", "id": 9 }))?;

    assert!(eventually(WAIT, || seen.lock().len() == 1).await);
    assert_eq!(broker.sends().len(), 1);
    Ok(())
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_reconnect_resubscribes_and_resumes_delivery() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);

    let (seen, callback) = recorder();
    let _orders = client.subscribe(topics::ORDERS, callback);
    let _stages = client.subscribe(topics::STAGES, |_| {});

    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(2).await);

    broker.drop_connections();

    assert!(eventually(WAIT, || broker.connect_count() == 2).await);
    assert!(broker.wait_for_subscriptions(2).await);
    assert!(eventually(WAIT, || client.is_connected()).await);

    // Fresh transport ids on the new connection
    let subscribes = broker.subscribes();
    assert_eq!(subscribes.len(), 4);
    assert_ne!(subscribes[0].0, subscribes[2].0);

    broker.publish(topics::ORDERS, r#"{"entity":"ORDER","id":1}"#);
    assert!(eventually(WAIT, || seen.lock().len() == 1).await);
    assert_eq!(client.subscription_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = RealtimeClient::builder()
        .endpoint(broker.endpoint())
        .reconnect(fast_reconnect().with_max_attempts(2))
        .build()?;
    let _sub = client.subscribe(topics::ORDERS, |_| {});

    within(client.connect()).await?;
    broker.shutdown();

    assert!(eventually(WAIT, || client.state() == ConnectionState::Disconnected).await);
    assert!(!client.is_connected());
    assert_eq!(client.subscription_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_no_reconnect_settles_disconnected() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = RealtimeClient::builder()
        .endpoint(broker.endpoint())
        .no_reconnect()
        .build()?;

    within(client.connect()).await?;
    broker.drop_connections();

    assert!(eventually(WAIT, || client.state() == ConnectionState::Disconnected).await);
    assert_eq!(broker.connect_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_silent_broker_detected_by_heartbeat() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    broker.set_silent_heart_beat("100,100");
    let client = RealtimeClient::builder()
        .endpoint(broker.endpoint())
        .heartbeat(HeartbeatConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
        ))
        .reconnect(fast_reconnect())
        .build()?;
    let (seen, callback) = recorder();
    let _sub = client.subscribe(topics::STAGES, callback);

    within(client.connect()).await?;
    assert!(eventually(WAIT, || broker.heartbeats_received() >= 1).await);

    // Silence past the liveness window forces a reconnect
    assert!(eventually(WAIT, || broker.connect_count() == 2).await);
    assert!(eventually(WAIT, || client.is_connected()).await);
    assert!(broker.wait_for_subscriptions(1).await);
    assert_eq!(broker.subscribes().len(), 2);

    broker.publish(topics::STAGES, r#"{"entity":"STAGE","id":3}"#);
    assert!(eventually(WAIT, || seen.lock().len() == 1).await);
    Ok(())
}

#[tokio::test]
async fn test_failed_connect_during_backoff_stays_connecting() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = RealtimeClient::builder()
        .endpoint(broker.endpoint())
        .reconnect(ReconnectPolicy::new().with_initial_delay(Duration::from_secs(2)))
        .build()?;

    within(client.connect()).await?;
    broker.set_reject(true);
    broker.drop_connections();
    assert!(eventually(WAIT, || client.state() == ConnectionState::Connecting).await);

    let err = within(client.connect()).await.unwrap_err();

    assert!(matches!(err, Error::Connect(ref cause) if matches!(**cause, Error::Handshake { .. })));
    assert_eq!(client.state(), ConnectionState::Connecting);

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

// ============================================================================
// Disconnect
// ============================================================================

#[tokio::test]
async fn test_disconnect_clears_registry_for_next_connect() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let client = client_for(&broker);

    let _a = client.subscribe(topics::ORDERS, |_| {});
    let _b = client.subscribe(topics::STAGES, |_| {});
    within(client.connect()).await?;
    assert!(broker.wait_for_subscriptions(2).await);

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.subscription_count(), 0);
    assert!(eventually(WAIT, || broker.session_count() == 0).await);

    within(client.connect()).await?;
    assert!(eventually(WAIT, || broker.session_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.live_subscriptions().len(), 0);
    assert_eq!(broker.subscribes().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_shared_context_shutdown_disconnects() -> Result<()> {
    init_tracing();
    let broker = FakeBroker::start().await;
    let context = SharedContext::from_client(client_for(&broker));

    let dashboard = context.consumer();
    within(dashboard.activate()).await?;
    dashboard.on_orders(|_| {});
    assert!(broker.wait_for_subscriptions(1).await);

    context.shutdown();

    assert!(!context.is_connected());
    assert!(eventually(WAIT, || broker.session_count() == 0).await);
    Ok(())
}
