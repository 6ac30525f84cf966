//! Upstream Bridge Integration Tests
//!
//! Runs a bridge against a local WebSocket server speaking the KIS framing.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use tick_gateway::infrastructure::kis::bridge::BridgeError;
use tick_gateway::infrastructure::kis::{HeartbeatConfig, ReconnectConfig};
use tick_gateway::{
    ApprovalKey, AuthError, BridgeConfig, BridgeState, BrokerCredentials, Tick,
    UpstreamAuthenticator, UpstreamBridge,
};

const WAIT: Duration = Duration::from_secs(5);

const PINGPONG: &str = r#"{"header":{"tr_id":"PINGPONG","datetime":"20240102093000"}}"#;

const SUBSCRIBE_OK: &str = r#"{"header":{"tr_id":"H0STCNT0","tr_key":"005930","encrypt":"N"},"body":{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS"}}"#;

const APPROVAL_REJECTED: &str = r#"{"header":{"tr_id":"H0STCNT0","tr_key":"005930","encrypt":"N"},"body":{"rt_cd":"1","msg_cd":"OPSP8996","msg1":"invalid approval : NOT FOUND"}}"#;

struct FixedKey {
    calls: AtomicUsize,
}

#[async_trait]
impl UpstreamAuthenticator for FixedKey {
    async fn approval_key(&self, _credentials: &BrokerCredentials) -> Result<ApprovalKey, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApprovalKey::new("test-approval-key"))
    }
}

fn fast_config(url: String, max_attempts: u32) -> BridgeConfig {
    BridgeConfig {
        url,
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        },
        heartbeat: HeartbeatConfig {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
        },
        connect_timeout: Duration::from_secs(2),
        resubscribe_delay: Duration::from_millis(5),
    }
}

fn new_bridge(config: BridgeConfig, auth: Arc<FixedKey>) -> Arc<UpstreamBridge> {
    Arc::new(UpstreamBridge::new(
        "alice",
        config,
        BrokerCredentials::new("app", "secret"),
        auth,
        CancellationToken::new(),
    ))
}

fn fixed_key() -> Arc<FixedKey> {
    Arc::new(FixedKey {
        calls: AtomicUsize::new(0),
    })
}

fn tick_channel(bridge: &UpstreamBridge) -> mpsc::UnboundedReceiver<Tick> {
    let (tx, rx) = mpsc::unbounded_channel();
    bridge.set_tick_handler(Arc::new(move |tick| {
        let _ = tx.send(tick);
    }));
    rx
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            return text.to_string();
        }
    }
}

async fn next_request(ws: &mut WebSocketStream<TcpStream>) -> (String, String) {
    let request: Value = serde_json::from_str(&next_text(ws).await).unwrap();
    (
        request["header"]["tr_type"].as_str().unwrap().to_string(),
        request["body"]["input"]["tr_key"].as_str().unwrap().to_string(),
    )
}

fn execution_frame(code: &str, price: &str, change: &str) -> String {
    format!("0|H0STCNT0|001|{code}^093000^{price}^2^{change}^100^0^0^0^0^0")
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_next_tick_delivered() {
    let (listener, url) = listen().await;
    let bridge = new_bridge(fast_config(url, 0), fixed_key());
    let mut ticks = tick_channel(&bridge);
    bridge.subscribe("005930");

    let run = tokio::spawn(Arc::clone(&bridge).run());
    let mut ws = accept(&listener).await;

    let (tr_type, code) = next_request(&mut ws).await;
    assert_eq!((tr_type.as_str(), code.as_str()), ("1", "005930"));

    ws.send(Message::Text("not a frame".to_string().into())).await.unwrap();
    ws.send(Message::Text(execution_frame("005930", "71500", "+1.20").into()))
        .await
        .unwrap();

    let tick = timeout(WAIT, ticks.recv()).await.unwrap().unwrap();
    assert_eq!(tick.symbol, "005930");
    assert_eq!(tick.price, dec!(71500));
    assert_eq!(tick.change_percent, dec!(1.20));
    assert!(ticks.try_recv().is_err());
    assert_eq!(bridge.state(), BridgeState::Connected);

    bridge.close();
    assert!(timeout(WAIT, run).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn pingpong_is_echoed_verbatim() {
    let (listener, url) = listen().await;
    let bridge = new_bridge(fast_config(url, 0), fixed_key());

    let run = tokio::spawn(Arc::clone(&bridge).run());
    let mut ws = accept(&listener).await;

    ws.send(Message::Text(PINGPONG.to_string().into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, PINGPONG);

    bridge.close();
    assert!(timeout(WAIT, run).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn subscriptions_are_replayed_after_reconnect() {
    let (listener, url) = listen().await;
    let auth = fixed_key();
    let bridge = new_bridge(fast_config(url, 0), Arc::clone(&auth));
    bridge.subscribe("005930");
    bridge.subscribe("000660");

    let run = tokio::spawn(Arc::clone(&bridge).run());

    let mut first = accept(&listener).await;
    let mut codes = vec![next_request(&mut first).await.1, next_request(&mut first).await.1];
    codes.sort();
    assert_eq!(codes, vec!["000660", "005930"]);
    drop(first);

    let mut second = accept(&listener).await;
    let mut replayed = vec![
        next_request(&mut second).await.1,
        next_request(&mut second).await.1,
    ];
    replayed.sort();
    assert_eq!(replayed, codes);

    // Key is cached across reconnects.
    assert_eq!(auth.calls.load(Ordering::SeqCst), 1);

    bridge.close();
    assert!(timeout(WAIT, run).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn unsubscribe_is_sent_while_connected() {
    let (listener, url) = listen().await;
    let bridge = new_bridge(fast_config(url, 0), fixed_key());
    bridge.subscribe("005930");

    let run = tokio::spawn(Arc::clone(&bridge).run());
    let mut ws = accept(&listener).await;
    assert_eq!(next_request(&mut ws).await.0, "1");

    assert!(bridge.unsubscribe("005930"));
    let (tr_type, code) = next_request(&mut ws).await;
    assert_eq!((tr_type.as_str(), code.as_str()), ("2", "005930"));
    assert!(bridge.subscriptions().is_empty());

    bridge.close();
    assert!(timeout(WAIT, run).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn refused_endpoint_gives_up_once() {
    let (listener, url) = listen().await;
    drop(listener);

    let bridge = new_bridge(fast_config(url, 3), fixed_key());

    let result = timeout(WAIT, Arc::clone(&bridge).run()).await.unwrap();

    match result {
        Err(BridgeError::MaxReconnectAttemptsExceeded { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected give-up, got {other:?}"),
    }
    assert_eq!(bridge.state(), BridgeState::Failed);
}

#[tokio::test]
async fn close_during_backoff_returns_promptly() {
    let (listener, url) = listen().await;
    drop(listener);

    let mut config = fast_config(url, 0);
    config.reconnect.initial_delay = Duration::from_secs(30);
    config.reconnect.max_delay = Duration::from_secs(30);
    let bridge = new_bridge(config, fixed_key());

    let run = tokio::spawn(Arc::clone(&bridge).run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    bridge.close();

    assert!(timeout(WAIT, run).await.unwrap().unwrap().is_ok());
    assert_eq!(bridge.state(), BridgeState::Closed);
}

/// Accept connections forever, answering the first request on each with
/// `reply` and then hanging up.
fn answer_and_hang_up(listener: TcpListener, reply: &'static str) -> Arc<AtomicUsize> {
    let connections = Arc::new(AtomicUsize::new(0));
    let accepted = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let _ = ws.next().await;
            let _ = ws.send(Message::Text(reply.to_string().into())).await;
        }
    });
    connections
}

#[tokio::test]
async fn rejected_approval_key_counts_toward_give_up() {
    let (listener, url) = listen().await;
    let connections = answer_and_hang_up(listener, APPROVAL_REJECTED);

    let auth = fixed_key();
    let bridge = new_bridge(fast_config(url, 3), Arc::clone(&auth));
    bridge.subscribe("005930");

    let result = timeout(WAIT, Arc::clone(&bridge).run()).await.unwrap();

    match result {
        Err(BridgeError::MaxReconnectAttemptsExceeded { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected give-up, got {other:?}"),
    }
    assert_eq!(bridge.state(), BridgeState::Failed);
    assert_eq!(connections.load(Ordering::SeqCst), 3);
    // The key is re-issued after every rejection.
    assert_eq!(auth.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn acknowledged_session_resets_failure_count() {
    let (listener, url) = listen().await;
    let connections = answer_and_hang_up(listener, SUBSCRIBE_OK);

    let bridge = new_bridge(fast_config(url, 2), fixed_key());
    bridge.subscribe("005930");

    let run = tokio::spawn(Arc::clone(&bridge).run());
    timeout(WAIT, async {
        while connections.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bridge stopped reconnecting");

    assert_ne!(bridge.state(), BridgeState::Failed);
    bridge.close();
    assert!(timeout(WAIT, run).await.unwrap().unwrap().is_ok());
}
