//! Upstream reconnection tests on a paused clock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{ScriptedConnector, channel_transport, ticker_packet};
use dhan_stream_proxy::infrastructure::dhan::ReconnectConfig;
use dhan_stream_proxy::{
    ClientHub, ClientManager, ConnectionState, FeedClient, FeedClientConfig, FeedCredentials,
    FeedError, FeedEvent, FeedFrame, FeedHandle, Outbound, SubscriptionRegistry,
};

fn config(max_attempts: u32) -> FeedClientConfig {
    let mut config = FeedClientConfig::new(
        "ws://feed.test",
        FeedCredentials::new("token", "1100").unwrap(),
    );
    config.reconnect = ReconnectConfig {
        step: Duration::from_secs(5),
        max_delay: Duration::from_secs(60),
        max_attempts,
    };
    config
}

fn start_feed(
    connector: Arc<ScriptedConnector>,
    registry: Arc<SubscriptionRegistry>,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> (FeedClient, FeedHandle, mpsc::Receiver<FeedEvent>) {
    let (event_tx, event_rx) = mpsc::channel(256);
    let (client, handle) = FeedClient::new(
        config(max_attempts),
        connector,
        registry,
        event_tx,
        cancel.clone(),
    );
    (client, handle, event_rx)
}

fn manager(registry: Arc<SubscriptionRegistry>, handle: FeedHandle) -> ClientManager {
    ClientManager::new(Arc::new(ClientHub::new()), registry, Arc::new(handle))
}

async fn next_event(events: &mut mpsc::Receiver<FeedEvent>) -> FeedEvent {
    events.recv().await.expect("feed event stream ended")
}

fn subscribe_json(segment: &str, security_id: &str) -> String {
    format!(
        r#"{{"type":"subscribe","instruments":[{{"exchangeSegment":"{segment}","securityId":"{security_id}"}}]}}"#
    )
}

// =============================================================================
// Subscription Replay
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reconnect_replays_all_subscriptions_in_one_request() {
    let cancel = CancellationToken::new();
    let registry = Arc::new(SubscriptionRegistry::new());
    let (first, first_control) = channel_transport();
    let (second, mut second_control) = channel_transport();
    let connector = Arc::new(ScriptedConnector::new(vec![Some(first), Some(second)]));
    let (client, handle, mut events) =
        start_feed(Arc::clone(&connector), Arc::clone(&registry), 5, &cancel);
    let manager = manager(Arc::clone(&registry), handle);
    let task = tokio::spawn(client.run());

    assert_eq!(next_event(&mut events).await, FeedEvent::Connected);

    let (tx, _rx) = mpsc::channel(16);
    let downstream = manager.on_client_connected(tx);
    manager.on_client_message(&downstream, &subscribe_json("BSE_EQ", "500325"));
    manager.on_client_message(&downstream, &subscribe_json("NSE_EQ", "2885"));
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Subscribed { count: 1 }
    );
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Subscribed { count: 1 }
    );

    let lost_at = tokio::time::Instant::now();
    let common::TransportControl {
        frames,
        sent: _first_sent,
        ..
    } = first_control;
    drop(frames);

    assert_eq!(next_event(&mut events).await, FeedEvent::Disconnected);
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Reconnecting { attempt: 1 }
    );
    assert_eq!(next_event(&mut events).await, FeedEvent::Connected);
    assert_eq!(lost_at.elapsed().as_secs(), 5);
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Subscribed { count: 2 }
    );

    let replay: Value = serde_json::from_str(&second_control.sent.recv().await.unwrap()).unwrap();
    assert_eq!(replay["RequestCode"], 15);
    assert_eq!(replay["InstrumentCount"], 2);
    assert!(second_control.sent.try_recv().is_err());
    assert_eq!(connector.calls(), 2);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_reconnecting_is_replayed_on_connect() {
    let cancel = CancellationToken::new();
    let registry = Arc::new(SubscriptionRegistry::new());
    let (session, mut control) = channel_transport();
    let connector = Arc::new(ScriptedConnector::new(vec![None, Some(session)]));
    let (client, handle, mut events) =
        start_feed(Arc::clone(&connector), Arc::clone(&registry), 5, &cancel);
    let manager = manager(Arc::clone(&registry), handle);
    let task = tokio::spawn(client.run());

    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Reconnecting { attempt: 1 }
    );

    let (tx, mut rx) = mpsc::channel(16);
    let downstream = manager.on_client_connected(tx);
    rx.recv().await.unwrap();
    manager.on_client_message(&downstream, &subscribe_json("NSE_FNO", "35001"));

    // Acked even though nothing could be sent yet.
    let Some(Outbound::Text(ack)) = rx.recv().await else {
        panic!("expected subscribe ack");
    };
    assert_eq!(ack.as_str(), r#"{"type":"subscribed","count":1}"#);

    assert_eq!(next_event(&mut events).await, FeedEvent::Connected);
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Subscribed { count: 1 }
    );
    let replay: Value = serde_json::from_str(&control.sent.recv().await.unwrap()).unwrap();
    assert_eq!(replay["InstrumentList"][0]["SecurityId"], 35_001);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

// =============================================================================
// Stall Detection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn silent_upstream_is_kept_open() {
    let cancel = CancellationToken::new();
    let (session, control) = channel_transport();
    let connector = Arc::new(ScriptedConnector::new(vec![Some(session)]));
    let (client, handle, mut events) = start_feed(
        Arc::clone(&connector),
        Arc::new(SubscriptionRegistry::new()),
        5,
        &cancel,
    );
    let state = handle.state();
    let task = tokio::spawn(client.run());

    assert_eq!(next_event(&mut events).await, FeedEvent::Connected);

    // Two full stall windows with no upstream data.
    tokio::time::sleep(Duration::from_secs(130)).await;

    assert!(events.try_recv().is_err());
    assert_eq!(connector.calls(), 1);
    assert!(state.is_connected());

    control
        .frames
        .send(FeedFrame::Binary(ticker_packet(4, 500_325, 2500.5, 7)))
        .unwrap();
    let FeedEvent::Tick(tick) = next_event(&mut events).await else {
        panic!("expected tick after stall");
    };
    assert_eq!(tick.security_id, "500325");

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancel_closes_upstream_socket_and_ends_task() {
    let cancel = CancellationToken::new();
    let (session, control) = channel_transport();
    let connector = Arc::new(ScriptedConnector::new(vec![Some(session)]));
    let (client, handle, mut events) = start_feed(
        Arc::clone(&connector),
        Arc::new(SubscriptionRegistry::new()),
        5,
        &cancel,
    );
    let state = handle.state();
    let task = tokio::spawn(client.run());
    assert_eq!(next_event(&mut events).await, FeedEvent::Connected);

    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(30), task)
        .await
        .expect("feed task outlived shutdown")
        .unwrap()
        .unwrap();
    assert!(control.was_closed());
    assert_eq!(state.state(), ConnectionState::Disconnected);
}

// =============================================================================
// Backoff
// =============================================================================

#[tokio::test(start_paused = true)]
async fn successful_connect_resets_attempt_counter() {
    let cancel = CancellationToken::new();
    let (session, control) = channel_transport();
    let connector = Arc::new(ScriptedConnector::new(vec![None, None, Some(session)]));
    let (client, handle, mut events) = start_feed(
        Arc::clone(&connector),
        Arc::new(SubscriptionRegistry::new()),
        5,
        &cancel,
    );
    let state = handle.state();
    let started = tokio::time::Instant::now();
    let task = tokio::spawn(client.run());

    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Reconnecting { attempt: 1 }
    );
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Reconnecting { attempt: 2 }
    );
    assert_eq!(next_event(&mut events).await, FeedEvent::Connected);
    assert_eq!(started.elapsed().as_secs(), 15);
    assert_eq!(state.reconnect_attempts(), 0);
    assert!(state.is_connected());

    drop(control);

    assert_eq!(next_event(&mut events).await, FeedEvent::Disconnected);
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Reconnecting { attempt: 1 }
    );
    assert_eq!(state.state(), ConnectionState::Reconnecting);

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(state.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_leave_clients_connected() {
    let cancel = CancellationToken::new();
    let registry = Arc::new(SubscriptionRegistry::new());
    let connector = Arc::new(ScriptedConnector::default());
    let (client, handle, events) =
        start_feed(Arc::clone(&connector), Arc::clone(&registry), 2, &cancel);
    let state = handle.state();
    let manager = Arc::new(manager(Arc::clone(&registry), handle));
    let relay = tokio::spawn(Arc::clone(&manager).relay_feed_events(events, cancel.clone()));

    let (tx, mut rx) = mpsc::channel(16);
    let downstream = manager.on_client_connected(tx);
    rx.recv().await.unwrap();

    let result = client.run().await;
    assert!(matches!(
        result,
        Err(FeedError::MaxReconnectAttemptsExceeded(2))
    ));
    assert_eq!(connector.calls(), 3);
    assert!(state.unavailable_reason().is_some());

    // The relay ends once the feed client is gone.
    relay.await.unwrap();
    assert_eq!(manager.hub().client_count(), 1);
    assert!(rx.try_recv().is_err());

    manager.on_client_message(&downstream, &subscribe_json("BSE_EQ", "500325"));
    let Some(Outbound::Text(ack)) = rx.recv().await else {
        panic!("expected subscribe ack");
    };
    assert_eq!(ack.as_str(), r#"{"type":"subscribed","count":1}"#);
}
