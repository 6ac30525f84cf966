//! Client Gateway
//!
//! Everything facing browser clients:
//!
//! - **Protocol**: the JSON message types
//! - **Connection**: per-socket handle with a bounded outbound queue
//! - **Manager**: connection registry, subscriptions, and fan-out
//! - **Server**: the axum WebSocket endpoint

pub mod connection;
pub mod manager;
pub mod protocol;
pub mod server;

pub use connection::{ConnectionHandle, Delivery, GUEST_USER};
pub use manager::{Gateway, GatewayOptions, GatewayStats};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, decode_client_message};
pub use server::{GatewayServer, GatewayServerError, router};
