//! Upstream Bridge
//!
//! One persistent connection to the KIS real-time stream on behalf of one
//! user. The bridge owns the user's set of subscribed codes, replays it on
//! every (re)connect, decodes execution frames into [`Tick`]s, and hands
//! them to the registered tick handler in receipt order.
//!
//! # Stream URL
//!
//! - Production: `ws://ops.koreainvestment.com:21000`
//!
//! # State Machine
//!
//! ```text
//! Disconnected → Connecting → Connected
//!      ↑                          │ read error / EOF / idle timeout
//!      └──── Reconnecting ← Disconnected
//! ```
//!
//! An attempt only counts as successful once the upstream acknowledges a
//! subscription or delivers a tick; an opened socket whose approval key is
//! then rejected is still a failure.
//!
//! After too many consecutive failures the bridge moves to `Failed` and
//! [`UpstreamBridge::run`] returns
//! [`BridgeError::MaxReconnectAttemptsExceeded`]. [`UpstreamBridge::close`]
//! moves it to `Closed` from any state.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{self, CodecError, ControlFrame, UpstreamFrame};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{EXECUTION_TR_ID, SubscriptionAction};
use super::reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{ApprovalKey, AuthError, BrokerCredentials, UpstreamAuthenticator};
use crate::domain::market::Tick;
use crate::infrastructure::metrics::{self, TickSource};

/// Production real-time endpoint.
pub const DEFAULT_WS_URL: &str = "ws://ops.koreainvestment.com:21000";

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the upstream bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The transport did not open in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Obtaining an approval key failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The upstream refused the approval key.
    #[error("approval key rejected: {0}")]
    ApprovalRejected(String),

    /// Encoding a request failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Writing to the transport failed.
    #[error("send failed: {0}")]
    Send(String),

    /// No frame arrived within the idle timeout.
    #[error("no frames for {0:?}")]
    IdleTimeout(Duration),

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({attempts}) exceeded")]
    MaxReconnectAttemptsExceeded {
        /// Consecutive failed attempts.
        attempts: u32,
    },
}

impl BridgeError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WebSocket(_) | Self::Send(_) => "transport",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Auth(_) | Self::ApprovalRejected(_) => "auth",
            Self::Codec(_) => "codec",
            Self::IdleTimeout(_) => "idle_timeout",
            Self::ConnectionClosed => "closed",
            Self::MaxReconnectAttemptsExceeded { .. } => "max_attempts",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for an upstream bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// WebSocket URL.
    pub url: String,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Time allowed for the transport to open.
    pub connect_timeout: Duration,
    /// Pause between replayed subscribe requests.
    pub resubscribe_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: Duration::from_secs(10),
            resubscribe_delay: Duration::from_millis(100),
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Connection state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not connected; about to retry or not yet started.
    Disconnected,
    /// Authenticating or opening the transport.
    Connecting,
    /// Transport open, frames flowing.
    Connected,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Gave up after too many failures.
    Failed,
    /// Closed on request.
    Closed,
}

/// Callback invoked for every decoded tick.
pub type TickHandler = Arc<dyn Fn(Tick) + Send + Sync>;

type Outbound = (SubscriptionAction, String);

// =============================================================================
// Upstream Bridge
// =============================================================================

/// Per-user connection to the KIS real-time stream.
///
/// Manages the connection lifecycle including:
/// - Approval key handling (re-issued after a rejection)
/// - Heartbeat and idle watchdog
/// - Automatic reconnection with exponential backoff
/// - Subscription replay after reconnect
pub struct UpstreamBridge {
    user_id: String,
    config: BridgeConfig,
    credentials: BrokerCredentials,
    authenticator: Arc<dyn UpstreamAuthenticator>,
    approval_key: RwLock<Option<ApprovalKey>>,
    subscriptions: RwLock<BTreeSet<String>>,
    state: RwLock<BridgeState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    tick_handler: RwLock<Option<TickHandler>>,
    cancel: CancellationToken,
}

impl fmt::Debug for UpstreamBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamBridge")
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .field("subscriptions", &self.subscriptions.read().len())
            .finish_non_exhaustive()
    }
}

impl UpstreamBridge {
    /// Create a bridge for `user_id`.
    ///
    /// `cancel` is the bridge's own token; cancelling it is equivalent to
    /// [`close`](Self::close).
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        config: BridgeConfig,
        credentials: BrokerCredentials,
        authenticator: Arc<dyn UpstreamAuthenticator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            config,
            credentials,
            authenticator,
            approval_key: RwLock::new(None),
            subscriptions: RwLock::new(BTreeSet::new()),
            state: RwLock::new(BridgeState::Disconnected),
            outbound: Mutex::new(None),
            tick_handler: RwLock::new(None),
            cancel,
        }
    }

    /// Seed the bridge with an already issued approval key.
    #[must_use]
    pub fn with_approval_key(self, key: ApprovalKey) -> Self {
        *self.approval_key.write() = Some(key);
        self
    }

    /// User this bridge belongs to.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        *self.state.read()
    }

    /// Whether frames are currently flowing.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == BridgeState::Connected
    }

    /// Codes currently subscribed, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().iter().cloned().collect()
    }

    /// Register the callback for decoded ticks, replacing any previous one.
    pub fn set_tick_handler(&self, handler: TickHandler) {
        *self.tick_handler.write() = Some(handler);
    }

    /// Add a code to the subscription set.
    ///
    /// Sent immediately when connected, otherwise replayed on the next
    /// connect. Returns `false` if the code was already subscribed.
    pub fn subscribe(&self, code: &str) -> bool {
        let inserted = self.subscriptions.write().insert(code.to_string());
        if inserted {
            self.queue(SubscriptionAction::Subscribe, code);
        }
        inserted
    }

    /// Remove a code from the subscription set.
    ///
    /// Returns `false` if the code was not subscribed.
    pub fn unsubscribe(&self, code: &str) -> bool {
        let removed = self.subscriptions.write().remove(code);
        if removed {
            self.queue(SubscriptionAction::Unsubscribe, code);
        }
        removed
    }

    /// Stop the bridge for good.
    ///
    /// Takes effect immediately for new operations: no further connect is
    /// attempted and a pending backoff sleep is abandoned.
    pub fn close(&self) {
        self.cancel.cancel();
        self.outbound.lock().take();
        self.set_state(BridgeState::Closed);
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn queue(&self, action: SubscriptionAction, code: &str) {
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send((action, code.to_string()));
        }
    }

    fn set_state(&self, state: BridgeState) {
        let mut current = self.state.write();
        if *current == BridgeState::Closed {
            return;
        }
        *current = state;
    }

    fn dispatch(&self, tick: Tick) {
        let handler = self.tick_handler.read().clone();
        if let Some(handler) = handler {
            handler(tick);
        }
    }

    async fn ensure_approval_key(&self) -> Result<ApprovalKey, BridgeError> {
        let cached = self.approval_key.read().clone();
        if let Some(key) = cached {
            return Ok(key);
        }

        tracing::debug!(user_id = %self.user_id, "Requesting approval key");
        let key = self.authenticator.approval_key(&self.credentials).await?;
        *self.approval_key.write() = Some(key.clone());
        Ok(key)
    }

    /// Run the bridge connection loop.
    ///
    /// Returns `Ok(())` once closed, or
    /// [`BridgeError::MaxReconnectAttemptsExceeded`] exactly once after the
    /// reconnect ceiling is hit.
    ///
    /// # Errors
    ///
    /// Returns error when the bridge gives up reconnecting.
    pub async fn run(self: Arc<Self>) -> Result<(), BridgeError> {
        let mut reconnect_policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(user_id = %self.user_id, "Upstream bridge closed");
                self.set_state(BridgeState::Closed);
                return Ok(());
            }

            let result = self.connect_and_run(&mut reconnect_policy).await;
            self.outbound.lock().take();

            let error = match result {
                Ok(()) => continue,
                Err(e) if self.cancel.is_cancelled() => {
                    tracing::debug!(user_id = %self.user_id, error = %e, "Error after close");
                    continue;
                }
                Err(e) => e,
            };

            tracing::warn!(user_id = %self.user_id, error = %error, "Upstream connection error");
            metrics::record_upstream_error(error.kind());
            self.set_state(BridgeState::Disconnected);

            match reconnect_policy.record_failure() {
                Backoff::Retry(delay) => {
                    let attempt = reconnect_policy.failures();
                    tracing::info!(
                        user_id = %self.user_id,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting to KIS stream"
                    );
                    metrics::record_reconnect();
                    self.set_state(BridgeState::Reconnecting);

                    tokio::select! {
                        () = self.cancel.cancelled() => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Backoff::GiveUp { attempts } => {
                    tracing::error!(
                        user_id = %self.user_id,
                        attempts,
                        "Giving up on KIS stream"
                    );
                    self.set_state(BridgeState::Failed);
                    return Err(BridgeError::MaxReconnectAttemptsExceeded { attempts });
                }
            }
        }
    }

    /// Connect to the stream and run until error or cancellation.
    async fn connect_and_run(
        &self,
        reconnect_policy: &mut ReconnectPolicy,
    ) -> Result<(), BridgeError> {
        self.set_state(BridgeState::Connecting);
        let approval_key = self.ensure_approval_key().await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        tracing::info!(user_id = %self.user_id, url = %self.config.url, "Connecting to KIS stream");

        let timeout = self.config.connect_timeout;
        let (ws_stream, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(&self.config.url))
                .await
                .map_err(|_| BridgeError::ConnectTimeout(timeout))??;

        self.set_state(BridgeState::Connected);
        let mut confirmed = false;

        let (mut write, mut read) = ws_stream.split();

        // Install the writer before snapshotting so no subscribe is lost.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        *self.outbound.lock() = Some(outbound_tx);

        let mut replay: VecDeque<String> = self.subscriptions.read().iter().cloned().collect();
        if !replay.is_empty() {
            tracing::info!(
                user_id = %self.user_id,
                count = replay.len(),
                "Replaying subscriptions"
            );
        }
        let mut replay_timer = tokio::time::interval(self.config.resubscribe_delay);

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let heartbeat_cancel = self.cancel.child_token();
        let heartbeat_manager = HeartbeatManager::new(
            self.config.heartbeat.clone(),
            Arc::clone(&heartbeat_state),
            heartbeat_tx,
            heartbeat_cancel.clone(),
        );
        let _heartbeat_handle = tokio::spawn(heartbeat_manager.run());
        let _heartbeat_guard = heartbeat_cancel.drop_guard();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = replay_timer.tick(), if !replay.is_empty() => {
                    if let Some(code) = replay.pop_front() {
                        let still_wanted = self.subscriptions.read().contains(&code);
                        if still_wanted {
                            let request = codec::encode_subscription(
                                &approval_key,
                                SubscriptionAction::Subscribe,
                                EXECUTION_TR_ID,
                                &code,
                            )?;
                            send_text(&mut write, request).await?;
                        }
                    }
                }
                Some((action, code)) = outbound_rx.recv() => {
                    let request =
                        codec::encode_subscription(&approval_key, action, EXECUTION_TR_ID, &code)?;
                    send_text(&mut write, request).await?;
                    tracing::debug!(user_id = %self.user_id, code = %code, ?action, "Sent subscription request");
                }
                Some(heartbeat_event) = heartbeat_rx.recv() => {
                    match heartbeat_event {
                        HeartbeatEvent::SendPing => {
                            write
                                .send(Message::Ping(vec![].into()))
                                .await
                                .map_err(|e| BridgeError::Send(e.to_string()))?;
                        }
                        HeartbeatEvent::Timeout { idle } => {
                            return Err(BridgeError::IdleTimeout(idle));
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat_state.record_frame();
                            let accepted = self.handle_text_message(&text, &mut write).await?;
                            if accepted && !confirmed {
                                confirmed = true;
                                reconnect_policy.reset();
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat_state.record_frame();
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| BridgeError::Send(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!(user_id = %self.user_id, "Server sent close frame");
                            return Err(BridgeError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            heartbeat_state.record_frame();
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!(user_id = %self.user_id, "KIS stream ended");
                            return Err(BridgeError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Handle one text frame from the stream.
    ///
    /// Returns `true` when the frame shows the upstream accepted the
    /// approval key: a decoded tick or a successful acknowledgement.
    async fn handle_text_message<W>(&self, text: &str, write: &mut W) -> Result<bool, BridgeError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: fmt::Display,
    {
        let frame = match codec::decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::record_decode_error();
                tracing::warn!(user_id = %self.user_id, error = %e, "Dropping undecodable frame");
                return Ok(false);
            }
        };

        match frame {
            UpstreamFrame::Data(data) => match data.execution_ticks() {
                Ok(ticks) => {
                    for tick in ticks {
                        metrics::record_tick_received(TickSource::Bridge);
                        self.dispatch(tick);
                    }
                    return Ok(true);
                }
                Err(e) => {
                    metrics::record_decode_error();
                    tracing::warn!(
                        user_id = %self.user_id,
                        tr_id = %data.tr_id,
                        error = %e,
                        "Dropping data frame"
                    );
                }
            },
            UpstreamFrame::Control(ControlFrame::PingPong { raw }) => {
                send_text(write, raw).await?;
                tracing::trace!(user_id = %self.user_id, "Echoed PINGPONG");
            }
            UpstreamFrame::Control(ControlFrame::Ack(ack)) => {
                if ack.success {
                    tracing::debug!(
                        user_id = %self.user_id,
                        code = ?ack.tr_key,
                        message = %ack.message,
                        "Subscription acknowledged"
                    );
                    return Ok(true);
                } else if ack.is_approval_rejection() {
                    self.approval_key.write().take();
                    return Err(BridgeError::ApprovalRejected(ack.message));
                } else {
                    tracing::warn!(
                        user_id = %self.user_id,
                        code = ?ack.tr_key,
                        msg_cd = %ack.code,
                        message = %ack.message,
                        "Subscription rejected"
                    );
                }
            }
            UpstreamFrame::Control(ControlFrame::Other { tr_id }) => {
                tracing::trace!(user_id = %self.user_id, tr_id = %tr_id, "Ignoring control frame");
            }
        }

        Ok(false)
    }
}

async fn send_text<W>(write: &mut W, text: String) -> Result<(), BridgeError>
where
    W: SinkExt<Message> + Unpin,
    W::Error: fmt::Display,
{
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| BridgeError::Send(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockUpstreamAuthenticator;

    fn bridge(authenticator: MockUpstreamAuthenticator) -> UpstreamBridge {
        UpstreamBridge::new(
            "alice",
            BridgeConfig::default(),
            BrokerCredentials::new("app", "secret"),
            Arc::new(authenticator),
            CancellationToken::new(),
        )
    }

    #[test]
    fn default_config_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.url, "ws://ops.koreainvestment.com:21000");
        assert_eq!(config.resubscribe_delay, Duration::from_millis(100));
        assert_eq!(config.reconnect.max_attempts, 10);
    }

    #[test]
    fn subscribe_is_idempotent_while_disconnected() {
        let bridge = bridge(MockUpstreamAuthenticator::new());

        assert!(bridge.subscribe("005930"));
        assert!(!bridge.subscribe("005930"));
        assert!(bridge.subscribe("000660"));

        assert_eq!(bridge.subscriptions(), vec!["000660", "005930"]);
        assert_eq!(bridge.state(), BridgeState::Disconnected);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bridge = bridge(MockUpstreamAuthenticator::new());
        bridge.subscribe("005930");

        assert!(bridge.unsubscribe("005930"));
        assert!(!bridge.unsubscribe("005930"));
        assert!(bridge.subscriptions().is_empty());
    }

    #[test]
    fn close_is_terminal() {
        let bridge = bridge(MockUpstreamAuthenticator::new());

        bridge.close();
        bridge.set_state(BridgeState::Connecting);

        assert!(bridge.is_closed());
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn closed_bridge_never_authenticates() {
        let mut authenticator = MockUpstreamAuthenticator::new();
        authenticator.expect_approval_key().never();
        let bridge = Arc::new(bridge(authenticator));

        bridge.close();

        assert!(Arc::clone(&bridge).run().await.is_ok());
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn seeded_key_skips_authentication() {
        let mut authenticator = MockUpstreamAuthenticator::new();
        authenticator.expect_approval_key().never();
        let bridge = bridge(authenticator).with_approval_key(ApprovalKey::new("seed"));

        let key = bridge.ensure_approval_key().await.unwrap();

        assert_eq!(key.expose(), "seed");
    }

    #[tokio::test]
    async fn missing_key_is_fetched_once() {
        let mut authenticator = MockUpstreamAuthenticator::new();
        authenticator
            .expect_approval_key()
            .times(1)
            .returning(|_| Ok(ApprovalKey::new("fresh")));
        let bridge = bridge(authenticator);

        bridge.ensure_approval_key().await.unwrap();
        let key = bridge.ensure_approval_key().await.unwrap();

        assert_eq!(key.expose(), "fresh");
    }

    #[test]
    fn tick_handler_receives_dispatched_ticks() {
        let bridge = bridge(MockUpstreamAuthenticator::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bridge.set_tick_handler(Arc::new(move |tick: Tick| sink.lock().push(tick.symbol)));

        bridge.dispatch(Tick::new("005930", rust_decimal::Decimal::ONE, rust_decimal::Decimal::ZERO));

        assert_eq!(*seen.lock(), vec!["005930".to_string()]);
    }
}
