mod common;

use common::{wait_until, Broker};
use moimate::auth::{AuthSession, Tokens};
use moimate::bus::{Event, EventBus};
use moimate::chat::ChatMessage;
use moimate::realtime::{
    room_destination, room_topic, ConnectionState, HeartBeat, RealtimeConfig, RealtimeError,
    RealtimeHandle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn logged_in(access: &str) -> AuthSession {
    let auth = AuthSession::in_memory();
    auth.set_tokens(Tokens {
        access: access.to_string(),
        refresh: None,
    })
    .await
    .unwrap();
    auth
}

fn fast_config(broker: &Broker) -> RealtimeConfig {
    let mut config = RealtimeConfig::new(broker.url());
    config.backoff.base = Duration::from_millis(20);
    config.backoff.max_delay = Duration::from_millis(100);
    config
}

#[tokio::test]
async fn publish_echoes_back_to_room_subscribers() {
    let broker = Broker::start().await;
    let handle = RealtimeHandle::connect(
        fast_config(&broker),
        logged_in("a-1").await,
        Arc::new(EventBus::new()),
    );
    handle.wait_connected().await.unwrap();

    let mut subscription = handle.subscribe(&room_topic(7)).await.unwrap();
    broker.wait_for_subscribers(&room_topic(7), 1).await;

    handle
        .publish(&room_destination(7), r#"{"roomId":7,"content":"안녕"}"#.to_string())
        .await
        .unwrap();

    let inbound = timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound.destination, room_topic(7));
    let message: ChatMessage = serde_json::from_str(&inbound.body).unwrap();
    assert_eq!(message.text, "안녕");

    assert_eq!(broker.tokens(), vec![Some("a-1".to_string())]);
    assert_eq!(
        broker.sent(),
        vec![(room_destination(7), r#"{"roomId":7,"content":"안녕"}"#.to_string())]
    );

    handle.disconnect().await;
    handle.disconnect().await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn dropped_subscription_unsubscribes() {
    let broker = Broker::start().await;
    let handle = RealtimeHandle::connect(
        fast_config(&broker),
        logged_in("a-1").await,
        Arc::new(EventBus::new()),
    );
    handle.wait_connected().await.unwrap();

    let subscription = handle.subscribe(&room_topic(3)).await.unwrap();
    broker.wait_for_subscribers(&room_topic(3), 1).await;
    drop(subscription);
    wait_until(|| broker.subscribers(&room_topic(3)) == 0).await;

    handle.disconnect().await;
}

#[tokio::test]
async fn reconnects_and_replays_subscriptions() {
    let broker = Broker::start().await;
    let bus = Arc::new(EventBus::new());
    let mut events = bus.subscribe();
    let handle = RealtimeHandle::connect(fast_config(&broker), logged_in("a-1").await, bus);
    handle.wait_connected().await.unwrap();

    let mut subscription = handle.subscribe(&room_topic(7)).await.unwrap();
    broker.wait_for_subscribers(&room_topic(7), 1).await;

    broker.kill_connections();
    wait_until(|| broker.connects() >= 2).await;
    broker.wait_for_subscribers(&room_topic(7), 1).await;
    handle.wait_connected().await.unwrap();

    broker.push(&room_topic(7), common::chat_message_json(42, "mina", "back", 3));
    let inbound = timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    let message: ChatMessage = serde_json::from_str(&inbound.body).unwrap();
    assert_eq!(message.id, 42);

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::Connection(state) = event {
            states.push(state);
        }
    }
    assert!(states.contains(&ConnectionState::Degraded { attempt: 1 }));
    assert_eq!(states.last(), Some(&ConnectionState::Connected));

    handle.disconnect().await;
}

#[tokio::test]
async fn publish_while_degraded_is_rejected() {
    let broker = Broker::start().await;
    let mut config = RealtimeConfig::new(broker.url());
    config.backoff.base = Duration::from_secs(30);
    config.backoff.max_delay = Duration::from_secs(30);
    let handle = RealtimeHandle::connect(config, logged_in("a-1").await, Arc::new(EventBus::new()));
    handle.wait_connected().await.unwrap();

    broker.kill_connections();
    let mut state = handle.watch_state();
    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| matches!(s, ConnectionState::Degraded { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    let result = handle
        .publish(&room_destination(7), r#"{"roomId":7,"content":"lost?"}"#.to_string())
        .await;
    assert!(matches!(result, Err(RealtimeError::NotConnected)));
    assert!(broker.sent().is_empty());

    handle.disconnect().await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn silent_server_is_dropped_after_missed_heart_beats() {
    // The broker promises a beat every 50 ms and then stays quiet.
    let broker = Broker::start_with_heart_beat("50,0").await;
    let mut config = fast_config(&broker);
    config.heart_beat = HeartBeat::new(0, 50);
    let handle = RealtimeHandle::connect(config, logged_in("a-1").await, Arc::new(EventBus::new()));
    handle.wait_connected().await.unwrap();

    wait_until(|| broker.connects() >= 2).await;

    handle.disconnect().await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn quiet_server_without_heart_beats_is_kept() {
    let broker = Broker::start().await;
    let mut config = fast_config(&broker);
    config.heart_beat = HeartBeat::new(0, 50);
    let handle = RealtimeHandle::connect(config, logged_in("a-1").await, Arc::new(EventBus::new()));
    handle.wait_connected().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.connects(), 1);
    assert_eq!(handle.state(), ConnectionState::Connected);

    handle.disconnect().await;
    wait_until(|| broker.disconnects() == 1).await;
}
