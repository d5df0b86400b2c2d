//! Shared fixtures for integration tests: an in-memory feed transport, a
//! scripted connector, a recording subscription sink and a WebSocket
//! client for the downstream server.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use dhan_stream_proxy::{
    ClientManager, ClientServer, ClientSettings, FeedConnector, FeedError, FeedFrame,
    FeedTransport, InstrumentKey, SubscriptionSink,
};

// =============================================================================
// Upstream Fakes
// =============================================================================

/// Feed transport driven by channels held by the test.
pub struct ChannelTransport {
    frames: mpsc::UnboundedReceiver<FeedFrame>,
    sent: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// Test side of a [`ChannelTransport`]. Dropping `frames` ends the
/// session as if the server closed it.
pub struct TransportControl {
    pub frames: mpsc::UnboundedSender<FeedFrame>,
    pub sent: mpsc::UnboundedReceiver<String>,
    pub closed: Arc<AtomicBool>,
}

impl TransportControl {
    /// Whether the feed client closed the transport.
    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn channel_transport() -> (ChannelTransport, TransportControl) {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        ChannelTransport {
            frames: frame_rx,
            sent: sent_tx,
            closed: Arc::clone(&closed),
        },
        TransportControl {
            frames: frame_tx,
            sent: sent_rx,
            closed,
        },
    )
}

#[async_trait]
impl FeedTransport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.sent
            .send(text)
            .map_err(|_| FeedError::Transport("test receiver dropped".to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<FeedFrame, FeedError>> {
        self.frames.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector that replays a script: `Some` hands out a session, `None`
/// fails the attempt. An exhausted script fails every attempt.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Option<ChannelTransport>>>,
    calls: AtomicU32,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Option<ChannelTransport>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedConnector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn FeedTransport>, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front().flatten() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(FeedError::UpstreamUnavailable("connection refused".to_string())),
        }
    }
}

/// Subscription sink that records every request.
#[derive(Default)]
pub struct RecordingSink {
    pub requests: Mutex<Vec<Vec<InstrumentKey>>>,
}

impl SubscriptionSink for RecordingSink {
    fn request_subscription(&self, instruments: Vec<InstrumentKey>) -> Result<(), FeedError> {
        self.requests.lock().push(instruments);
        Ok(())
    }
}

/// Build a 17-byte ticker packet.
pub fn ticker_packet(segment: u8, security_id: u32, ltp: f32, ltt: u32) -> Vec<u8> {
    let mut packet = vec![2, 16, 0, segment];
    packet.extend_from_slice(&security_id.to_le_bytes());
    packet.extend_from_slice(&ltp.to_le_bytes());
    packet.extend_from_slice(&ltt.to_le_bytes());
    packet.push(0);
    packet
}

// =============================================================================
// Downstream Server
// =============================================================================

/// Serve `manager` on an ephemeral local port.
pub async fn start_server(manager: Arc<ClientManager>, cancel: CancellationToken) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = ClientServer::new(addr.port(), manager, ClientSettings::default(), cancel);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    addr
}

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect_client(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws
}

pub async fn send_json(ws: &mut WsClient, text: &str) {
    ws.send(Message::text(text)).await.unwrap();
}

/// Next JSON text frame, skipping control frames.
pub async fn recv_json(ws: &mut WsClient) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
