//! Client Protocol
//!
//! JSON text frames exchanged with browser clients, tagged by `type`.
//!
//! ```text
//! → {"type":"ping"}                          ← {"type":"pong","timestamp":1718000000000}
//! → {"type":"subscribe","symbol":"005930"}   ← {"type":"subscribed","symbol":"005930"}
//!                                            ← {"type":"update","data":{...}}
//! → {"type":"unsubscribe","symbol":"005930"}
//! → {"type":"auth","keys":{...}}             ← {"type":"auth_success"}
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::application::ports::BrokerCredentials;
use crate::domain::market::Quote;

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive; answered with `pong`.
    Ping,
    /// Answer to a server `ping`; only refreshes liveness.
    Pong,
    /// Watch `symbol`, replacing the current subscription.
    Subscribe {
        /// Symbol as the client spells it.
        symbol: String,
    },
    /// Stop watching `symbol`.
    Unsubscribe {
        /// Symbol as the client spells it.
        symbol: String,
    },
    /// Link brokerage credentials to this connection's user.
    Auth {
        /// Broker app key, secret, and optional account.
        keys: BrokerCredentials,
    },
}

/// Messages the gateway sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a client `ping`.
    Pong {
        /// Server time in epoch milliseconds.
        timestamp: i64,
    },
    /// Server-initiated keepalive.
    Ping {
        /// Server time in epoch milliseconds.
        timestamp: i64,
    },
    /// Subscription confirmed.
    Subscribed {
        /// Symbol as the client spelled it.
        symbol: String,
    },
    /// Price update.
    Update {
        /// Quote snapshot.
        data: Quote,
    },
    /// Credentials accepted and the upstream session is starting.
    AuthSuccess,
    /// Request could not be handled; the connection stays open.
    Error {
        /// Human-readable reason.
        message: String,
    },
    /// The user's upstream session stopped for good.
    SessionFailed {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// `pong` stamped now.
    #[must_use]
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// `ping` stamped now.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// `error` with `message`.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Metrics label for this message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Pong { .. } => "pong",
            Self::Ping { .. } => "ping",
            Self::Subscribed { .. } => "subscribed",
            Self::Update { .. } => "update",
            Self::AuthSuccess => "auth_success",
            Self::Error { .. } => "error",
            Self::SessionFailed { .. } => "session_failed",
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Client protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not a known client message.
    #[error("Invalid message: {0}")]
    Decode(String),

    /// Outbound message could not be serialized.
    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Decode one client text frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] for anything that is not a well-formed
/// client message.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
}
