//! KIS Real-Time Message Types
//!
//! Wire format types for the KIS real-time WebSocket channel.
//!
//! # Message Types
//!
//! ## Data Frames (pipe-delimited text)
//! `flag|tr_id|count|payload`, where `flag` is `0` (plain) or `1`
//! (encrypted), `count` is the number of records, and `payload` holds the
//! records' fields joined by `^`.
//!
//! ## Control Frames (JSON)
//! - `PINGPONG`: keepalive probe, must be echoed back verbatim
//! - Subscription acknowledgements: `header.tr_id` plus a `body` carrying
//!   `rt_cd` (`"0"` on success), `msg_cd`, and `msg1`
//!
//! ## Requests (JSON)
//! Subscribe and unsubscribe requests share one envelope and differ only in
//! `tr_type`.

use serde::{Deserialize, Serialize};

// =============================================================================
// Transaction Ids
// =============================================================================

/// Real-time domestic stock execution (체결) feed.
pub const EXECUTION_TR_ID: &str = "H0STCNT0";

/// Keepalive control frame.
pub const PINGPONG_TR_ID: &str = "PINGPONG";

/// Index of the instrument code within an execution record.
pub const FIELD_CODE: usize = 0;

/// Index of the last traded price within an execution record.
pub const FIELD_PRICE: usize = 2;

/// Index of the change rate versus previous close (percent).
pub const FIELD_CHANGE_RATE: usize = 4;

/// An execution record must carry more fields than this.
pub const MIN_EXECUTION_FIELDS: usize = 10;

// =============================================================================
// Control Frames
// =============================================================================

/// JSON control frame as sent by the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlMessage {
    /// Frame header.
    pub header: ControlHeader,
    /// Response body, absent on keepalives.
    #[serde(default)]
    pub body: Option<ControlBody>,
}

/// Control frame header.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlHeader {
    /// Transaction id the frame refers to.
    #[serde(default)]
    pub tr_id: String,
    /// Instrument code, on subscription responses.
    #[serde(default)]
    pub tr_key: Option<String>,
}

/// Control frame body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlBody {
    /// Result code, `"0"` on success.
    #[serde(default)]
    pub rt_cd: String,
    /// Message code.
    #[serde(default)]
    pub msg_cd: String,
    /// Human-readable message.
    #[serde(default)]
    pub msg1: String,
}

// =============================================================================
// Requests
// =============================================================================

/// Direction of a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    /// Start receiving a feed.
    Subscribe,
    /// Stop receiving a feed.
    Unsubscribe,
}

impl SubscriptionAction {
    /// Value of the `tr_type` header.
    #[must_use]
    pub const fn tr_type(self) -> &'static str {
        match self {
            Self::Subscribe => "1",
            Self::Unsubscribe => "2",
        }
    }
}

/// Subscribe or unsubscribe request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest<'a> {
    /// Request header.
    pub header: RequestHeader<'a>,
    /// Request body.
    pub body: RequestBody<'a>,
}

/// Request header.
#[derive(Debug, Clone, Serialize)]
pub struct RequestHeader<'a> {
    /// Approval key for this connection.
    pub approval_key: &'a str,
    /// Customer type, `P` for individuals.
    pub custtype: &'a str,
    /// `1` subscribe, `2` unsubscribe.
    pub tr_type: &'a str,
    /// Always `utf-8`.
    #[serde(rename = "content-type")]
    pub content_type: &'a str,
}

/// Request body.
#[derive(Debug, Clone, Serialize)]
pub struct RequestBody<'a> {
    /// Feed selector.
    pub input: RequestInput<'a>,
}

/// Feed selector.
#[derive(Debug, Clone, Serialize)]
pub struct RequestInput<'a> {
    /// Transaction id of the feed.
    pub tr_id: &'a str,
    /// Instrument code.
    pub tr_key: &'a str,
}
