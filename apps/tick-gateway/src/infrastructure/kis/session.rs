//! Session Multiplexer
//!
//! Owns at most one [`UpstreamBridge`] per user. Sessions are created when a
//! user's client supplies credentials and destroyed when the gateway reports
//! that the user's last connection is gone. The multiplexer does not count
//! connections itself.
//!
//! Credentials live inside the bridge and are dropped with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::bridge::{BridgeConfig, BridgeError, TickHandler, UpstreamBridge};
use crate::application::ports::{BrokerCredentials, UpstreamAuthenticator};
use crate::domain::market::Tick;
use crate::infrastructure::metrics;

/// Receives everything a session produces for its user.
pub trait SessionHandler: Send + Sync {
    /// A tick decoded by the user's bridge.
    fn on_tick(&self, user_id: &str, tick: Tick);

    /// The user's bridge gave up reconnecting. Called once per session.
    fn on_session_failed(&self, user_id: &str, attempts: u32);
}

#[derive(Debug)]
enum SessionSlot {
    /// Authentication in flight; no bridge yet.
    Starting { generation: u64 },
    /// Bridge running.
    Active {
        generation: u64,
        bridge: Arc<UpstreamBridge>,
    },
}

impl SessionSlot {
    const fn generation(&self) -> u64 {
        match self {
            Self::Starting { generation } | Self::Active { generation, .. } => *generation,
        }
    }
}

type Registry = Arc<RwLock<HashMap<String, SessionSlot>>>;

/// Per-user bridge registry.
pub struct SessionMultiplexer {
    config: BridgeConfig,
    authenticator: Arc<dyn UpstreamAuthenticator>,
    sessions: Registry,
    next_generation: AtomicU64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMultiplexer")
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl SessionMultiplexer {
    /// Create a multiplexer. Every bridge gets a child of `cancel`.
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        authenticator: Arc<dyn UpstreamAuthenticator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            authenticator,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            cancel,
        }
    }

    /// Start a session for `user_id` unless one exists.
    ///
    /// Performs the approval handshake, builds the bridge, wires `handler`,
    /// and spawns the bridge without waiting for it to connect. Returns
    /// `false` only when authentication fails or the session was stopped
    /// while it was starting.
    pub async fn start_session(
        &self,
        user_id: &str,
        credentials: BrokerCredentials,
        handler: Arc<dyn SessionHandler>,
    ) -> bool {
        let generation = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(user_id) {
                tracing::debug!(user_id, "Session already exists");
                return true;
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            sessions.insert(user_id.to_string(), SessionSlot::Starting { generation });
            generation
        };

        let approval_key = match self.authenticator.approval_key(&credentials).await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Upstream authentication failed");
                remove_generation(&self.sessions, user_id, generation);
                return false;
            }
        };

        let bridge = Arc::new(
            UpstreamBridge::new(
                user_id,
                self.config.clone(),
                credentials,
                Arc::clone(&self.authenticator),
                self.cancel.child_token(),
            )
            .with_approval_key(approval_key),
        );
        bridge.set_tick_handler(tick_handler(user_id, Arc::clone(&handler)));

        {
            let mut sessions = self.sessions.write();
            let still_starting = matches!(
                sessions.get(user_id),
                Some(SessionSlot::Starting { generation: g }) if *g == generation
            );
            if !still_starting {
                drop(sessions);
                tracing::info!(user_id, "Session stopped while starting");
                bridge.close();
                return false;
            }
            sessions.insert(
                user_id.to_string(),
                SessionSlot::Active {
                    generation,
                    bridge: Arc::clone(&bridge),
                },
            );
        }
        self.update_gauge();

        tracing::info!(user_id, "Upstream session started");
        self.spawn_supervisor(user_id.to_string(), generation, bridge, handler);
        true
    }

    fn spawn_supervisor(
        &self,
        user_id: String,
        generation: u64,
        bridge: Arc<UpstreamBridge>,
        handler: Arc<dyn SessionHandler>,
    ) {
        let sessions = Arc::clone(&self.sessions);

        tokio::spawn(async move {
            let result = Arc::clone(&bridge).run().await;

            let Err(error) = result else {
                tracing::debug!(user_id = %user_id, "Bridge task finished");
                return;
            };

            if !remove_generation(&sessions, &user_id, generation) {
                return;
            }
            metrics::set_upstream_sessions(session_gauge(&sessions));
            metrics::record_session_failure();

            let attempts = match error {
                BridgeError::MaxReconnectAttemptsExceeded { attempts } => attempts,
                _ => 0,
            };
            tracing::error!(user_id = %user_id, attempts, "Upstream session failed");
            handler.on_session_failed(&user_id, attempts);
        });
    }

    /// Close and remove the user's session.
    ///
    /// Returns `false` when the user had no session.
    pub fn stop_session(&self, user_id: &str) -> bool {
        let removed = self.sessions.write().remove(user_id);
        let stopped = match removed {
            Some(SessionSlot::Active { bridge, .. }) => {
                bridge.close();
                true
            }
            Some(SessionSlot::Starting { .. }) => true,
            None => false,
        };

        if stopped {
            tracing::info!(user_id, "Upstream session stopped");
            self.update_gauge();
        }
        stopped
    }

    /// Subscribe the user's bridge to `code`.
    ///
    /// Returns `false` (and does nothing) if the user has no active session.
    pub fn subscribe_for_user(&self, user_id: &str, code: &str) -> bool {
        self.bridge(user_id).is_some_and(|bridge| {
            bridge.subscribe(code);
            true
        })
    }

    /// Unsubscribe the user's bridge from `code`.
    ///
    /// Returns `false` (and does nothing) if the user has no active session.
    pub fn unsubscribe_for_user(&self, user_id: &str, code: &str) -> bool {
        self.bridge(user_id).is_some_and(|bridge| {
            bridge.unsubscribe(code);
            true
        })
    }

    /// Whether the user has a running bridge.
    #[must_use]
    pub fn has_session(&self, user_id: &str) -> bool {
        self.bridge(user_id).is_some()
    }

    /// The user's bridge, if active.
    #[must_use]
    pub fn bridge(&self, user_id: &str) -> Option<Arc<UpstreamBridge>> {
        match self.sessions.read().get(user_id) {
            Some(SessionSlot::Active { bridge, .. }) => Some(Arc::clone(bridge)),
            _ => None,
        }
    }

    /// Number of sessions, including ones still authenticating.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Number of sessions whose bridge currently has an open transport.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|slot| matches!(slot, SessionSlot::Active { bridge, .. } if bridge.is_connected()))
            .count()
    }

    /// Close every session.
    pub fn shutdown(&self) {
        let drained: Vec<SessionSlot> = self.sessions.write().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            if let SessionSlot::Active { bridge, .. } = slot {
                bridge.close();
            }
        }
        self.update_gauge();
    }

    fn update_gauge(&self) {
        metrics::set_upstream_sessions(session_gauge(&self.sessions));
    }
}

fn tick_handler(user_id: &str, handler: Arc<dyn SessionHandler>) -> TickHandler {
    let user_id = user_id.to_string();
    Arc::new(move |tick| handler.on_tick(&user_id, tick))
}

/// Remove the user's slot only if it still belongs to `generation`.
fn remove_generation(sessions: &Registry, user_id: &str, generation: u64) -> bool {
    let mut sessions = sessions.write();
    if sessions.get(user_id).map(SessionSlot::generation) == Some(generation) {
        sessions.remove(user_id);
        true
    } else {
        false
    }
}

#[allow(clippy::cast_precision_loss)]
fn session_gauge(sessions: &Registry) -> f64 {
    sessions.read().len() as f64
}
