//! Client Connection Handle
//!
//! The gateway-side view of one client socket. The socket itself is owned by
//! the transport task; the handle only holds the outbound queue feeding it.

use std::time::Instant;

use axum::extract::ws::Utf8Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::BrokerCredentials;
use crate::domain::subscription::ConnectionId;

/// User id assigned to connections that did not identify themselves.
pub const GUEST_USER: &str = "guest";

/// Outcome of queueing a frame for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Frame queued for the writer.
    Queued,
    /// Queue full; frame dropped.
    Dropped,
    /// Writer gone; the connection should be torn down.
    Closed,
}

/// One registered client connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    client_id: String,
    user_id: String,
    credentials: RwLock<Option<BrokerCredentials>>,
    last_ping: Mutex<Instant>,
    outbound: mpsc::Sender<Utf8Bytes>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("user_id", &self.user_id)
            .field("has_credentials", &self.credentials.read().is_some())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub(super) fn new(
        id: ConnectionId,
        client_id: &str,
        user_id: &str,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            client_id: client_id.to_string(),
            user_id: user_id.to_string(),
            credentials: RwLock::new(None),
            last_ping: Mutex::new(Instant::now()),
            outbound,
            cancel,
        };
        (handle, rx)
    }

    /// Gateway-assigned connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Id the client put in the URL path.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Owning user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether the connection never identified a user.
    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.user_id == GUEST_USER
    }

    /// Remember credentials for this connection (memory only).
    pub fn set_credentials(&self, credentials: BrokerCredentials) {
        *self.credentials.write() = Some(credentials);
    }

    /// Forget credentials.
    pub fn clear_credentials(&self) {
        *self.credentials.write() = None;
    }

    /// Whether credentials were supplied.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.credentials.read().is_some()
    }

    /// Record client liveness.
    pub fn touch(&self) {
        *self.last_ping.lock() = Instant::now();
    }

    /// Last time the client proved it was alive.
    #[must_use]
    pub fn last_ping(&self) -> Instant {
        *self.last_ping.lock()
    }

    /// Token cancelled when the connection is torn down.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the transport to close.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection was torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }

    /// Queue a frame without waiting.
    pub fn try_deliver(&self, frame: Utf8Bytes) -> Delivery {
        if self.cancel.is_cancelled() {
            return Delivery::Closed;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Utf8Bytes>) {
        ConnectionHandle::new(1, "client_a", "alice", capacity, CancellationToken::new())
    }

    #[test]
    fn full_queue_drops() {
        let (conn, mut rx) = handle(1);

        assert_eq!(conn.try_deliver("one".into()), Delivery::Queued);
        assert_eq!(conn.try_deliver("two".into()), Delivery::Dropped);

        assert_eq!(rx.try_recv().unwrap().as_str(), "one");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_reports_closed() {
        let (conn, rx) = handle(4);
        drop(rx);

        assert_eq!(conn.try_deliver("x".into()), Delivery::Closed);
        assert!(conn.is_closed());
    }

    #[test]
    fn close_stops_delivery() {
        let (conn, _rx) = handle(4);
        conn.close();

        assert_eq!(conn.try_deliver("x".into()), Delivery::Closed);
    }

    #[test]
    fn credentials_are_redacted_and_clearable() {
        let (conn, _rx) = handle(1);
        conn.set_credentials(BrokerCredentials::new("app-key", "app-secret"));

        let debug = format!("{conn:?}");
        assert!(!debug.contains("app-key"));
        assert!(conn.has_credentials());

        conn.clear_credentials();
        assert!(!conn.has_credentials());
    }

    #[test]
    fn guest_detection() {
        let (guest, _rx) = ConnectionHandle::new(2, "c", GUEST_USER, 1, CancellationToken::new());
        assert!(guest.is_guest());
        assert!(!handle(1).0.is_guest());
    }
}
