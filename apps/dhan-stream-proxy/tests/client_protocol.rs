//! Downstream client protocol tests over real WebSocket connections.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use futures_util::SinkExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use common::{
    RecordingSink, ScriptedConnector, channel_transport, connect_client, recv_json, send_json,
    start_server, ticker_packet, wait_until,
};
use dhan_stream_proxy::{
    ClientHub, ClientManager, ExchangeSegment, FeedClient, FeedClientConfig, FeedCredentials,
    FeedFrame, InstrumentKey, SubscriptionRegistry, SubscriptionSink,
};

fn manager_with(sink: Arc<dyn SubscriptionSink>) -> Arc<ClientManager> {
    Arc::new(ClientManager::new(
        Arc::new(ClientHub::new()),
        Arc::new(SubscriptionRegistry::new()),
        sink,
    ))
}

// =============================================================================
// Control Messages
// =============================================================================

#[tokio::test]
async fn client_is_greeted_on_connect() {
    let cancel = CancellationToken::new();
    let manager = manager_with(Arc::new(RecordingSink::default()));
    let addr = start_server(Arc::clone(&manager), cancel.clone()).await;

    let mut ws = connect_client(addr).await;

    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "status", "message": "Connected to price feed"})
    );
    assert_eq!(manager.hub().client_count(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn ping_gets_pong() {
    let cancel = CancellationToken::new();
    let addr = start_server(
        manager_with(Arc::new(RecordingSink::default())),
        cancel.clone(),
    )
    .await;
    let mut ws = connect_client(addr).await;
    recv_json(&mut ws).await;

    send_json(&mut ws, r#"{"type":"ping"}"#).await;

    assert_eq!(recv_json(&mut ws).await, json!({"type": "pong"}));
    cancel.cancel();
}

#[tokio::test]
async fn malformed_messages_are_ignored() {
    let cancel = CancellationToken::new();
    let addr = start_server(
        manager_with(Arc::new(RecordingSink::default())),
        cancel.clone(),
    )
    .await;
    let mut ws = connect_client(addr).await;
    recv_json(&mut ws).await;

    send_json(&mut ws, "not json").await;
    send_json(&mut ws, r#"{"type":"unsubscribe"}"#).await;
    send_json(&mut ws, r#"{"type":"ping"}"#).await;

    // The connection survives and the next reply is the pong.
    assert_eq!(recv_json(&mut ws).await, json!({"type": "pong"}));
    cancel.cancel();
}

#[tokio::test]
async fn subscribe_is_sent_upstream_as_one_batch() {
    let cancel = CancellationToken::new();
    let sink = Arc::new(RecordingSink::default());
    let manager = manager_with(Arc::clone(&sink) as Arc<dyn SubscriptionSink>);
    let addr = start_server(Arc::clone(&manager), cancel.clone()).await;
    let mut ws = connect_client(addr).await;
    recv_json(&mut ws).await;

    send_json(
        &mut ws,
        r#"{"type":"subscribe","instruments":[
            {"exchangeSegment":"BSE_EQ","securityId":"500325"},
            {"exchangeSegment":1,"securityId":2885},
            {"exchangeSegment":"MARS","securityId":"1"}
        ]}"#,
    )
    .await;

    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "subscribed", "count": 3})
    );

    let requests = sink.requests.lock().clone();
    assert_eq!(
        requests,
        vec![vec![
            InstrumentKey::new(ExchangeSegment::BSE_EQ, "500325"),
            InstrumentKey::new(ExchangeSegment::NSE_EQ, "2885"),
        ]]
    );
    assert_eq!(manager.registry().stats().upstream_subscriptions, 2);

    cancel.cancel();
}

#[tokio::test]
async fn second_client_reuses_upstream_subscription() {
    let cancel = CancellationToken::new();
    let sink = Arc::new(RecordingSink::default());
    let manager = manager_with(Arc::clone(&sink) as Arc<dyn SubscriptionSink>);
    let addr = start_server(Arc::clone(&manager), cancel.clone()).await;
    let subscribe = r#"{"type":"subscribe","instruments":[{"exchangeSegment":"NSE_FNO","securityId":"35001"}]}"#;

    let mut a = connect_client(addr).await;
    recv_json(&mut a).await;
    send_json(&mut a, subscribe).await;
    recv_json(&mut a).await;

    let mut b = connect_client(addr).await;
    recv_json(&mut b).await;
    send_json(&mut b, subscribe).await;

    assert_eq!(
        recv_json(&mut b).await,
        json!({"type": "subscribed", "count": 1})
    );
    assert_eq!(sink.requests.lock().len(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn closed_client_is_forgotten() {
    let cancel = CancellationToken::new();
    let manager = manager_with(Arc::new(RecordingSink::default()));
    let addr = start_server(Arc::clone(&manager), cancel.clone()).await;
    let mut ws = connect_client(addr).await;
    recv_json(&mut ws).await;
    send_json(
        &mut ws,
        r#"{"type":"subscribe","instruments":[{"exchangeSegment":"NSE_EQ","securityId":"2885"}]}"#,
    )
    .await;
    recv_json(&mut ws).await;

    ws.send(Message::Close(None)).await.unwrap();
    drop(ws);

    wait_until(|| manager.hub().client_count() == 0).await;
    let stats = manager.registry().stats();
    assert_eq!(stats.interested_clients, 0);
    // The upstream subscription outlives its last client.
    assert_eq!(stats.upstream_subscriptions, 1);

    cancel.cancel();
}

// =============================================================================
// End To End
// =============================================================================

#[tokio::test]
async fn upstream_tick_reaches_every_client() {
    let cancel = CancellationToken::new();
    let registry = Arc::new(SubscriptionRegistry::new());
    let (transport, mut upstream) = channel_transport();
    let connector = Arc::new(ScriptedConnector::new(vec![Some(transport)]));
    let (event_tx, event_rx) = mpsc::channel(64);

    let (client, handle) = FeedClient::new(
        FeedClientConfig::new(
            "ws://feed.test",
            FeedCredentials::new("token", "1100").unwrap(),
        ),
        connector,
        Arc::clone(&registry),
        event_tx,
        cancel.clone(),
    );
    let feed_state = handle.state();
    tokio::spawn(client.run());
    wait_until(|| feed_state.is_connected()).await;

    let manager = Arc::new(ClientManager::new(
        Arc::new(ClientHub::new()),
        registry,
        Arc::new(handle),
    ));
    tokio::spawn(Arc::clone(&manager).relay_feed_events(event_rx, cancel.clone()));
    let addr = start_server(Arc::clone(&manager), cancel.clone()).await;

    let mut a = connect_client(addr).await;
    recv_json(&mut a).await;
    send_json(
        &mut a,
        r#"{"type":"subscribe","instruments":[{"exchangeSegment":"BSE_EQ","securityId":"500325"}]}"#,
    )
    .await;
    assert_eq!(
        recv_json(&mut a).await,
        json!({"type": "subscribed", "count": 1})
    );

    let request: serde_json::Value =
        serde_json::from_str(&upstream.sent.recv().await.unwrap()).unwrap();
    assert_eq!(request["RequestCode"], 15);
    assert_eq!(request["InstrumentCount"], 1);
    assert_eq!(request["InstrumentList"][0]["ExchangeSegment"], 4);
    assert_eq!(request["InstrumentList"][0]["SecurityId"], 500_325);

    let mut b = connect_client(addr).await;
    recv_json(&mut b).await;

    upstream
        .frames
        .send(FeedFrame::Binary(ticker_packet(4, 500_325, 2500.5, 1_700_000_000)))
        .unwrap();

    for ws in [&mut a, &mut b] {
        let tick = recv_json(ws).await;
        assert_eq!(tick["type"], "ticker");
        assert_eq!(tick["exchangeSegment"], 4);
        assert_eq!(tick["securityId"], "500325");
        assert_eq!(tick["ltp"], 2500.5);
        assert_eq!(tick["ltt"], 1_700_000_000);
        assert!(tick["timestamp"].is_i64());
    }

    cancel.cancel();
}
