//! KIS Real-Time Adapters
//!
//! Client side of the Korea Investment & Securities real-time stream:
//!
//! - **Codec**: pipe-delimited data frames and JSON control frames
//! - **Auth**: approval key issuance over REST
//! - **Bridge**: one reconnecting connection per user
//! - **Session**: the per-user bridge registry

pub mod auth;
pub mod bridge;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod session;

pub use auth::KisApprovalClient;
pub use bridge::{BridgeConfig, BridgeError, BridgeState, TickHandler, UpstreamBridge};
pub use codec::{CodecError, ControlFrame, DataFrame, UpstreamFrame, decode_frame, encode_subscription};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
pub use session::{SessionHandler, SessionMultiplexer};
