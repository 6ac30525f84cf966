//! Gateway / Connection Manager
//!
//! Owns every client connection and the subscription index, and is the one
//! fan-out path for both upstream bridge ticks and fallback poller quotes.
//!
//! # Fan-out
//!
//! Each connection has a bounded outbound queue drained by its writer task.
//! Delivery never waits: a full queue drops the frame, a closed queue tears
//! the connection down. Locks are only held to snapshot recipients.
//!
//! # Sessions
//!
//! The gateway counts connections per user. When a user's last connection
//! goes away it stops that user's upstream session.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionHandle, Delivery, GUEST_USER};
use super::protocol::{ClientMessage, ServerMessage, decode_client_message};
use crate::application::ports::{BrokerCredentials, QuoteSink, TickObserver};
use crate::application::services::QuoteWorkerPool;
use crate::domain::market::{Quote, Tick, canonicalize};
use crate::domain::subscription::{ConnectionId, SubscriptionIndex};
use crate::infrastructure::config::ClientSettings;
use crate::infrastructure::kis::{SessionHandler, SessionMultiplexer};
use crate::infrastructure::metrics;

// =============================================================================
// Options
// =============================================================================

/// Per-connection behaviour.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Interval between server `ping` frames.
    pub heartbeat_interval: Duration,
    /// Outbound frames buffered per connection.
    pub queue_capacity: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for GatewayOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval,
            queue_capacity: settings.queue_capacity,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of gateway occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    /// Registered client connections.
    pub total_connections: usize,
    /// Connections holding a subscription.
    pub total_subscriptions: usize,
    /// Distinct users across connections.
    pub unique_users: usize,
    /// Distinct subscribed symbol keys.
    pub subscribed_symbols: usize,
    /// Upstream sessions, including ones still authenticating.
    pub upstream_sessions: usize,
}

// =============================================================================
// Gateway
// =============================================================================

/// Client connection registry and fan-out.
pub struct Gateway {
    options: GatewayOptions,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    index: SubscriptionIndex,
    sessions: Arc<SessionMultiplexer>,
    quotes: Arc<QuoteWorkerPool>,
    observers: RwLock<Vec<Arc<dyn TickObserver>>>,
    session_handler: Arc<GatewaySessionHandler>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Create a gateway. Every connection gets a child of `cancel`.
    #[must_use]
    pub fn new(
        options: GatewayOptions,
        sessions: Arc<SessionMultiplexer>,
        quotes: Arc<QuoteWorkerPool>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|gateway| Self {
            options,
            connections: RwLock::new(HashMap::new()),
            index: SubscriptionIndex::new(),
            sessions,
            quotes,
            observers: RwLock::new(Vec::new()),
            session_handler: Arc::new(GatewaySessionHandler {
                gateway: gateway.clone(),
            }),
            next_id: AtomicU64::new(1),
            cancel,
        })
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Register a connection and start its heartbeat.
    ///
    /// A missing or blank `user_id` registers the connection as
    /// [`GUEST_USER`]. Returns the handle and the receiver the transport's
    /// writer must drain.
    pub fn accept(
        self: &Arc<Self>,
        client_id: &str,
        user_id: Option<&str>,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Utf8Bytes>) {
        let user_id = user_id
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .unwrap_or(GUEST_USER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (handle, outbound) = ConnectionHandle::new(
            id,
            client_id,
            user_id,
            self.options.queue_capacity,
            self.cancel.child_token(),
        );
        let handle = Arc::new(handle);

        let total = {
            let mut connections = self.connections.write();
            connections.insert(id, Arc::clone(&handle));
            connections.len()
        };
        metrics::set_client_connections(gauge(total));
        tracing::info!(connection_id = id, client_id, user_id, total, "Client connected");

        self.spawn_heartbeat(&handle);
        (handle, outbound)
    }

    /// Remove a connection from every index and close its transport.
    ///
    /// Stops the user's upstream session when this was their last
    /// connection. Returns `false` if the connection was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let (conn, last_for_user, total) = {
            let mut connections = self.connections.write();
            let Some(conn) = connections.remove(&id) else {
                return false;
            };
            let last_for_user = !connections
                .values()
                .any(|other| other.user_id() == conn.user_id());
            (conn, last_for_user, connections.len())
        };

        conn.close();
        let previous = self.index.remove_connection(id);
        metrics::set_client_connections(gauge(total));
        tracing::info!(
            connection_id = id,
            user_id = conn.user_id(),
            total,
            "Client disconnected"
        );

        if last_for_user {
            if self.sessions.stop_session(conn.user_id()) {
                tracing::info!(user_id = conn.user_id(), "Last connection closed, session stopped");
            }
        } else if let Some(previous) = previous {
            self.release_upstream_code(conn.user_id(), &previous);
        }
        true
    }

    fn spawn_heartbeat(self: &Arc<Self>, conn: &Arc<ConnectionHandle>) {
        let gateway = Arc::downgrade(self);
        let conn = Arc::clone(conn);
        let period = self.options.heartbeat_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let cancel = conn.cancel_token();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(gateway) = gateway.upgrade() else {
                            break;
                        };
                        if gateway.send(&conn, &ServerMessage::ping()) == Delivery::Closed {
                            tracing::warn!(connection_id = conn.id(), "Heartbeat failed, disconnecting");
                            gateway.disconnect(conn.id());
                            break;
                        }
                    }
                }
            }
            tracing::debug!(connection_id = conn.id(), "Heartbeat stopped");
        });
    }

    // -------------------------------------------------------------------------
    // Client messages
    // -------------------------------------------------------------------------

    /// Handle one text frame from a client.
    ///
    /// Undecodable frames are answered with an `error` frame; the connection
    /// stays open. `auth` runs on its own task, so later frames from the same
    /// connection are handled while the approval request is in flight.
    pub fn handle_text(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, text: &str) {
        if conn.is_closed() {
            return;
        }

        let message = match decode_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(connection_id = conn.id(), error = %e, "Bad client frame");
                self.reply(conn, &ServerMessage::error(e.to_string()));
                return;
            }
        };

        match message {
            ClientMessage::Ping => {
                conn.touch();
                self.reply(conn, &ServerMessage::pong());
            }
            ClientMessage::Pong => conn.touch(),
            ClientMessage::Subscribe { symbol } => self.subscribe(conn, &symbol),
            ClientMessage::Unsubscribe { symbol } => self.unsubscribe(conn, &symbol),
            ClientMessage::Auth { keys } => self.spawn_authenticate(conn, keys),
        }
    }

    fn spawn_authenticate(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, keys: BrokerCredentials) {
        let gateway = Arc::clone(self);
        let conn = Arc::clone(conn);
        tokio::spawn(async move { gateway.authenticate(&conn, keys).await });
    }

    fn subscribe(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, symbol: &str) {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            self.reply(conn, &ServerMessage::error("Symbol must not be empty"));
            return;
        }

        // Holding the registry lock keeps a concurrent disconnect from
        // leaving a stale index entry behind.
        let previous = {
            let connections = self.connections.read();
            if !connections.contains_key(&conn.id()) {
                return;
            }
            self.index.subscribe(conn.id(), symbol)
        };

        tracing::info!(
            connection_id = conn.id(),
            user_id = conn.user_id(),
            symbol,
            previous = previous.as_deref().unwrap_or(""),
            "Client subscribed"
        );

        self.reply(
            conn,
            &ServerMessage::Subscribed {
                symbol: symbol.to_string(),
            },
        );
        self.spawn_initial_quote(conn, symbol);

        if let Some(code) = canonicalize(symbol).upstream_code() {
            self.sessions.subscribe_for_user(conn.user_id(), code);
        }
        if let Some(previous) = previous {
            self.release_upstream_code(conn.user_id(), &previous);
        }
    }

    fn unsubscribe(&self, conn: &ConnectionHandle, symbol: &str) {
        let symbol = symbol.trim();
        if self.index.unsubscribe(conn.id(), symbol) {
            tracing::info!(connection_id = conn.id(), symbol, "Client unsubscribed");
            self.release_upstream_code(conn.user_id(), symbol);
        }
    }

    async fn authenticate(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, keys: BrokerCredentials) {
        if conn.is_guest() {
            self.reply(conn, &ServerMessage::error("Sign in before linking brokerage keys"));
            return;
        }
        if !keys.is_complete() {
            self.reply(conn, &ServerMessage::error("Brokerage keys are incomplete"));
            return;
        }

        conn.set_credentials(keys.clone());
        let user_id = conn.user_id().to_string();
        let handler: Arc<dyn SessionHandler> = self.session_handler.clone();

        if !self.sessions.start_session(&user_id, keys, handler).await {
            conn.clear_credentials();
            self.reply(conn, &ServerMessage::error("Brokerage authentication failed"));
            return;
        }

        // Every connection of the user may have gone while approval was pending.
        if !self.has_user(&user_id) {
            self.sessions.stop_session(&user_id);
            return;
        }

        for symbol in self.user_subscriptions(&user_id) {
            if let Some(code) = canonicalize(&symbol).upstream_code() {
                self.sessions.subscribe_for_user(&user_id, code);
            }
        }

        tracing::info!(connection_id = conn.id(), user_id = %user_id, "Brokerage keys accepted");
        self.reply(conn, &ServerMessage::AuthSuccess);
    }

    fn has_user(&self, user_id: &str) -> bool {
        self.connections
            .read()
            .values()
            .any(|conn| conn.user_id() == user_id)
    }

    /// Fetch one quote off the event loop and send it to this connection
    /// only, if it still watches `symbol` when the fetch completes.
    fn spawn_initial_quote(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, symbol: &str) {
        let fetch = self.quotes.fetch(symbol);
        let gateway = Arc::downgrade(self);
        let conn = Arc::clone(conn);
        let symbol = symbol.to_string();

        tokio::spawn(async move {
            let quote = match fetch.await {
                Ok(quote) => quote,
                Err(e) => {
                    tracing::debug!(symbol = %symbol, error = %e, "Initial quote fetch failed");
                    return;
                }
            };
            let Some(gateway) = gateway.upgrade() else {
                return;
            };
            if !gateway.index.is_subscribed(conn.id(), &symbol) {
                tracing::debug!(connection_id = conn.id(), symbol = %symbol, "Discarding stale initial quote");
                return;
            }
            gateway.reply(
                &conn,
                &ServerMessage::Update {
                    data: quote.with_symbol(symbol),
                },
            );
        });
    }

    /// Unsubscribe the user's bridge from the code behind `symbol` unless
    /// another of the user's connections still watches it.
    fn release_upstream_code(&self, user_id: &str, symbol: &str) {
        let Some(code) = canonicalize(symbol).upstream_code().map(str::to_string) else {
            return;
        };
        let still_watched = self
            .user_subscriptions(user_id)
            .iter()
            .any(|other| canonicalize(other).upstream_code() == Some(code.as_str()));
        if !still_watched {
            self.sessions.unsubscribe_for_user(user_id, &code);
        }
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Send to every connection subscribed to exactly `symbol`.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast_public(&self, symbol: &str, message: &ServerMessage) -> usize {
        let targets = self.handles(&self.index.subscribers(symbol));
        self.deliver(&targets, message)
    }

    /// Send only to `user_id`'s connections subscribed to `symbol`.
    pub fn broadcast_private(&self, user_id: &str, symbol: &str, message: &ServerMessage) -> usize {
        let targets: Vec<_> = self
            .handles(&self.index.subscribers(symbol))
            .into_iter()
            .filter(|conn| conn.user_id() == user_id)
            .collect();
        self.deliver(&targets, message)
    }

    /// Send an upstream tick under every alias of its code.
    ///
    /// Each recipient sees the quote keyed by the symbol it subscribed with.
    pub fn broadcast_tick(&self, tick: &Tick) -> usize {
        let quote = tick.to_quote();
        canonicalize(&tick.symbol)
            .aliases()
            .into_iter()
            .map(|alias| {
                let message = ServerMessage::Update {
                    data: quote.clone().with_symbol(alias.as_str()),
                };
                self.broadcast_public(&alias, &message)
            })
            .sum()
    }

    /// Fan out a tick decoded by `user_id`'s bridge and notify observers.
    pub fn publish_tick(&self, user_id: &str, tick: &Tick) -> usize {
        let delivered = self.broadcast_tick(tick);

        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.on_tick(user_id, &tick.symbol, tick);
        }
        delivered
    }

    /// Send to every connection of `user_id`.
    pub fn notify_user(&self, user_id: &str, message: &ServerMessage) -> usize {
        let targets: Vec<_> = self
            .connections
            .read()
            .values()
            .filter(|conn| conn.user_id() == user_id)
            .cloned()
            .collect();
        self.deliver(&targets, message)
    }

    /// Register an observer for every upstream tick.
    pub fn add_observer(&self, observer: Arc<dyn TickObserver>) {
        self.observers.write().push(observer);
    }

    fn handles(&self, ids: &[ConnectionId]) -> Vec<Arc<ConnectionHandle>> {
        let connections = self.connections.read();
        ids.iter()
            .filter_map(|id| connections.get(id).cloned())
            .collect()
    }

    fn deliver(&self, targets: &[Arc<ConnectionHandle>], message: &ServerMessage) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let Some(frame) = encode(message) else {
            return 0;
        };

        let mut queued = 0_u64;
        let mut dropped = 0_u64;
        let mut closed = Vec::new();
        for conn in targets {
            match conn.try_deliver(frame.clone()) {
                Delivery::Queued => queued += 1,
                Delivery::Dropped => dropped += 1,
                Delivery::Closed => closed.push(conn.id()),
            }
        }

        metrics::record_messages_sent(message.kind(), queued);
        if dropped > 0 {
            metrics::record_messages_dropped(message.kind(), dropped);
            tracing::debug!(message_type = message.kind(), dropped, "Slow clients skipped");
        }
        for id in closed {
            self.disconnect(id);
        }
        usize::try_from(queued).unwrap_or(usize::MAX)
    }

    /// Queue one frame for one connection, recording metrics.
    fn send(&self, conn: &ConnectionHandle, message: &ServerMessage) -> Delivery {
        let Some(frame) = encode(message) else {
            return Delivery::Dropped;
        };
        let delivery = conn.try_deliver(frame);
        match delivery {
            Delivery::Queued => metrics::record_messages_sent(message.kind(), 1),
            Delivery::Dropped => metrics::record_messages_dropped(message.kind(), 1),
            Delivery::Closed => {}
        }
        delivery
    }

    /// Send a direct reply, tearing the connection down if it is gone.
    fn reply(&self, conn: &ConnectionHandle, message: &ServerMessage) {
        if self.send(conn, message) == Delivery::Closed {
            self.disconnect(conn.id());
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Current occupancy.
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        let (total_connections, unique_users) = {
            let connections = self.connections.read();
            let users: BTreeSet<&str> = connections.values().map(|c| c.user_id()).collect();
            (connections.len(), users.len())
        };
        let index = self.index.stats();

        GatewayStats {
            total_connections,
            total_subscriptions: index.subscription_count,
            unique_users,
            subscribed_symbols: index.symbol_count,
            upstream_sessions: self.sessions.session_count(),
        }
    }

    /// Distinct symbols watched by any of `user_id`'s connections, sorted.
    #[must_use]
    pub fn user_subscriptions(&self, user_id: &str) -> Vec<String> {
        let ids: Vec<ConnectionId> = self
            .connections
            .read()
            .values()
            .filter(|conn| conn.user_id() == user_id)
            .map(|conn| conn.id())
            .collect();

        let symbols: BTreeSet<String> = ids
            .into_iter()
            .filter_map(|id| self.index.symbol_of(id))
            .collect();
        symbols.into_iter().collect()
    }

    /// Distinct users with at least one connection, sorted.
    #[must_use]
    pub fn connected_user_ids(&self) -> Vec<String> {
        let users: BTreeSet<String> = self
            .connections
            .read()
            .values()
            .map(|conn| conn.user_id().to_string())
            .collect();
        users.into_iter().collect()
    }

    /// Every subscribed symbol key, sorted.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<String> {
        self.index.active_symbols()
    }

    /// The session registry the gateway drives.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionMultiplexer> {
        &self.sessions
    }
}

impl QuoteSink for Gateway {
    fn subscribed_symbols(&self) -> Vec<String> {
        self.index.active_symbols()
    }

    fn publish_quote(&self, symbol: &str, quote: &Quote) -> usize {
        self.broadcast_public(
            symbol,
            &ServerMessage::Update {
                data: quote.clone(),
            },
        )
    }
}

// =============================================================================
// Session Callbacks
// =============================================================================

/// Routes session events back into the gateway without keeping it alive.
struct GatewaySessionHandler {
    gateway: Weak<Gateway>,
}

impl SessionHandler for GatewaySessionHandler {
    fn on_tick(&self, user_id: &str, tick: Tick) {
        if let Some(gateway) = self.gateway.upgrade() {
            gateway.publish_tick(user_id, &tick);
        }
    }

    fn on_session_failed(&self, user_id: &str, attempts: u32) {
        if let Some(gateway) = self.gateway.upgrade() {
            let message = ServerMessage::SessionFailed {
                message: format!(
                    "Real-time feed stopped after {attempts} failed connection attempts; \
                     prices continue from polling"
                ),
            };
            gateway.notify_user(user_id, &message);
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Utf8Bytes> {
    match message.to_json() {
        Ok(text) => Some(Utf8Bytes::from(text)),
        Err(e) => {
            tracing::error!(message_type = message.kind(), error = %e, "Failed to encode frame");
            None
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn gauge(count: usize) -> f64 {
    count as f64
}

// =============================================================================
// Tests
// =============================================================================
