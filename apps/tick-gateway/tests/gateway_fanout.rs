//! Gateway Fan-Out Integration Tests
//!
//! Drives the client WebSocket endpoint over real sockets and checks what
//! subscribers receive.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tick_gateway::infrastructure::gateway::router;
use tick_gateway::infrastructure::kis::ReconnectConfig;
use tick_gateway::{
    ApprovalKey, AuthError, BridgeConfig, BrokerCredentials, FallbackPoller, FetchError, Gateway,
    GatewayOptions, Quote, QuoteFetcher, QuoteSink, QuoteWorkerPool, SessionMultiplexer, Tick,
    UpstreamAuthenticator,
};

const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct FlatQuotes;

impl QuoteFetcher for FlatQuotes {
    fn fetch_quote(&self, symbol: &str) -> Result<Quote, FetchError> {
        Ok(Quote {
            symbol: symbol.to_string(),
            price: "70,000".to_string(),
            change: "+0.00%".to_string(),
            name: None,
        })
    }
}

struct ApproveAll;

#[async_trait]
impl UpstreamAuthenticator for ApproveAll {
    async fn approval_key(&self, _credentials: &BrokerCredentials) -> Result<ApprovalKey, AuthError> {
        Ok(ApprovalKey::new("approval"))
    }
}

struct Harness {
    gateway: Arc<Gateway>,
    quotes: Arc<QuoteWorkerPool>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl Harness {
    /// Bridges point at a closed port and back off for a long time, so a
    /// session exists without ever connecting.
    async fn start() -> Self {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", closed.local_addr().unwrap());
        drop(closed);
        Self::with_upstream(url).await
    }

    async fn with_upstream(url: String) -> Self {
        let cancel = CancellationToken::new();
        let bridge_config = BridgeConfig {
            url,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
                max_attempts: 0,
                ..ReconnectConfig::default()
            },
            resubscribe_delay: Duration::from_millis(5),
            ..BridgeConfig::default()
        };

        let sessions = Arc::new(SessionMultiplexer::new(
            bridge_config,
            Arc::new(ApproveAll),
            cancel.child_token(),
        ));
        let quotes = Arc::new(QuoteWorkerPool::new(Arc::new(FlatQuotes), 2, 16));
        let gateway = Gateway::new(
            GatewayOptions::default(),
            sessions,
            Arc::clone(&quotes),
            cancel.child_token(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&gateway));
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .unwrap();
        });

        Self {
            gateway,
            quotes,
            addr,
            cancel,
        }
    }

    async fn connect(&self, client_id: &str, user_id: Option<&str>) -> Client {
        let url = match user_id {
            Some(user) => format!("ws://{}/ws/{client_id}?user_id={user}", self.addr),
            None => format!("ws://{}/ws/{client_id}", self.addr),
        };
        let (ws, _) = timeout(WAIT, tokio_tungstenite::connect_async(url))
            .await
            .unwrap()
            .unwrap();
        ws
    }

    async fn wait_for(&self, condition: impl Fn(&Gateway) -> bool) {
        timeout(WAIT, async {
            while !condition(&self.gateway) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn send(ws: &mut Client, message: Value) {
    ws.send(Message::Text(message.to_string().into())).await.unwrap();
}

/// Next JSON frame, skipping server heartbeats.
async fn recv(ws: &mut Client) -> Value {
    loop {
        let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] != "ping" {
                return value;
            }
        }
    }
}

/// Subscribe and consume the confirmation plus the initial snapshot.
async fn subscribe(ws: &mut Client, symbol: &str) {
    send(ws, json!({"type": "subscribe", "symbol": symbol})).await;

    let confirmed = recv(ws).await;
    assert_eq!(confirmed, json!({"type": "subscribed", "symbol": symbol}));

    let initial = recv(ws).await;
    assert_eq!(initial["type"], "update");
    assert_eq!(initial["data"]["symbol"], symbol);
    assert_eq!(initial["data"]["price"], "70,000");
}

#[tokio::test]
async fn domestic_tick_reaches_every_alias() {
    let harness = Harness::start().await;
    let mut bare = harness.connect("c1", Some("alice")).await;
    let mut kospi = harness.connect("c2", Some("bob")).await;
    let mut kosdaq = harness.connect("c3", None).await;

    subscribe(&mut bare, "005930").await;
    subscribe(&mut kospi, "005930.KS").await;
    subscribe(&mut kosdaq, "005930.KQ").await;

    let delivered = harness
        .gateway
        .broadcast_tick(&Tick::new("005930", dec!(71500), dec!(1.2)));
    assert_eq!(delivered, 3);

    for (ws, symbol) in [
        (&mut bare, "005930"),
        (&mut kospi, "005930.KS"),
        (&mut kosdaq, "005930.KQ"),
    ] {
        let update = recv(ws).await;
        assert_eq!(
            update,
            json!({
                "type": "update",
                "data": {"symbol": symbol, "price": "71,500", "change": "+1.20%"}
            })
        );
    }
}

#[tokio::test]
async fn upstream_tick_reaches_subscribed_client() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", upstream.local_addr().unwrap());
    let harness = Harness::with_upstream(url).await;

    let mut ws = harness.connect("c1", Some("alice")).await;
    subscribe(&mut ws, "005930").await;
    send(
        &mut ws,
        json!({"type": "auth", "keys": {"kis_app_key": "k", "kis_secret": "s"}}),
    )
    .await;
    assert_eq!(recv(&mut ws).await, json!({"type": "auth_success"}));

    let (stream, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();
    let mut kis = tokio_tungstenite::accept_async(stream).await.unwrap();
    let request = loop {
        let frame = timeout(WAIT, kis.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            break serde_json::from_str::<Value>(text.as_str()).unwrap();
        }
    };
    assert_eq!(request["body"]["input"]["tr_key"], "005930");

    let tick = "0|H0STCNT0|001|005930^093000^75000^2^+0.50^100^0^0^0^0^0";
    kis.send(Message::Text(tick.to_string().into())).await.unwrap();

    let update = recv(&mut ws).await;
    assert_eq!(
        update,
        json!({
            "type": "update",
            "data": {"symbol": "005930", "price": "75,000", "change": "+0.50%"}
        })
    );
}

#[tokio::test]
async fn resubscribe_moves_delivery_to_new_symbol() {
    let harness = Harness::start().await;
    let mut ws = harness.connect("c1", Some("alice")).await;

    subscribe(&mut ws, "005930").await;
    subscribe(&mut ws, "000660").await;

    let gateway = &harness.gateway;
    assert_eq!(gateway.active_symbols(), vec!["000660"]);
    assert_eq!(
        gateway.broadcast_tick(&Tick::new("005930", dec!(71500), dec!(0))),
        0
    );
    assert_eq!(
        gateway.broadcast_tick(&Tick::new("000660", dec!(128000), dec!(-0.5))),
        1
    );

    let update = recv(&mut ws).await;
    assert_eq!(update["data"]["symbol"], "000660");
    assert_eq!(update["data"]["change"], "-0.50%");
}

#[tokio::test]
async fn bad_frame_is_answered_and_connection_survives() {
    let harness = Harness::start().await;
    let mut ws = harness.connect("c1", Some("alice")).await;

    send(&mut ws, json!({"type": "teleport"})).await;
    assert_eq!(recv(&mut ws).await["type"], "error");

    send(&mut ws, json!({"type": "ping"})).await;
    let pong = recv(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_i64());
}

#[tokio::test]
async fn poller_cycle_updates_subscribers() {
    let harness = Harness::start().await;
    let mut ws = harness.connect("c1", None).await;
    subscribe(&mut ws, "AAPL").await;

    let poller = FallbackPoller::new(
        Arc::clone(&harness.gateway) as Arc<dyn QuoteSink>,
        Arc::clone(&harness.quotes),
        Duration::from_secs(1),
    );
    let summary = poller.poll_once().await;

    assert_eq!(summary.symbols, 1);
    assert_eq!(summary.published, 1);
    assert_eq!(summary.deliveries, 1);

    let update = recv(&mut ws).await;
    assert_eq!(update["type"], "update");
    assert_eq!(update["data"]["symbol"], "AAPL");
}

#[tokio::test]
async fn guest_cannot_link_keys() {
    let harness = Harness::start().await;
    let mut ws = harness.connect("c1", None).await;

    send(
        &mut ws,
        json!({"type": "auth", "keys": {"kis_app_key": "k", "kis_secret": "s"}}),
    )
    .await;

    assert_eq!(recv(&mut ws).await["type"], "error");
    assert_eq!(harness.gateway.sessions().session_count(), 0);
}

#[tokio::test]
async fn last_connection_stops_session() {
    let harness = Harness::start().await;
    let mut first = harness.connect("c1", Some("alice")).await;
    let mut second = harness.connect("c2", Some("alice")).await;

    subscribe(&mut first, "005930").await;
    send(
        &mut first,
        json!({"type": "auth", "keys": {"kis_app_key": "k", "kis_secret": "s"}}),
    )
    .await;
    assert_eq!(recv(&mut first).await, json!({"type": "auth_success"}));

    let sessions = Arc::clone(harness.gateway.sessions());
    assert!(sessions.has_session("alice"));
    let bridge = sessions.bridge("alice").unwrap();
    assert_eq!(bridge.subscriptions(), vec!["005930"]);

    // The other connection keeps the session but not the code.
    first.close(None).await.unwrap();
    harness
        .wait_for(|gateway| {
            gateway.stats().total_connections == 1 && bridge.subscriptions().is_empty()
        })
        .await;
    assert!(sessions.has_session("alice"));

    second.close(None).await.unwrap();
    harness
        .wait_for(|gateway| !gateway.sessions().has_session("alice"))
        .await;
    assert_eq!(harness.gateway.stats().total_connections, 0);
    assert!(bridge.is_closed());
}
