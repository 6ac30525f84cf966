//! Frame Codec
//!
//! Decodes raw text frames from the KIS real-time channel into either a data
//! frame or a control frame, and encodes subscription requests.
//!
//! Decode failures are never fatal: the upstream is not guaranteed to send
//! only frame types we understand, so callers log and drop them.

use std::str::FromStr;

use rust_decimal::Decimal;

use super::messages::{
    ControlMessage, EXECUTION_TR_ID, FIELD_CHANGE_RATE, FIELD_CODE, FIELD_PRICE,
    MIN_EXECUTION_FIELDS, PINGPONG_TR_ID, RequestBody, RequestHeader, RequestInput,
    SubscriptionAction, SubscriptionRequest,
};
use crate::application::ports::ApprovalKey;
use crate::domain::market::Tick;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame was empty.
    #[error("empty frame")]
    Empty,

    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// A data frame did not have four pipe-separated parts.
    #[error("malformed data frame: {0}")]
    Malformed(String),

    /// The data frame belongs to a feed we do not decode.
    #[error("unexpected transaction id: {0}")]
    UnexpectedTransaction(String),

    /// The payload was encrypted.
    #[error("encrypted payload for {0}")]
    Encrypted(String),

    /// A record had too few fields.
    #[error("expected more than {expected} fields, got {actual}")]
    TooFewFields {
        /// Minimum field count (exclusive).
        expected: usize,
        /// Fields actually present.
        actual: usize,
    },

    /// A numeric field did not parse.
    #[error("invalid {field}: {value:?}")]
    InvalidNumber {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: String,
    },
}

/// A decoded upstream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    /// Pipe-delimited market data.
    Data(DataFrame),
    /// JSON control message.
    Control(ControlFrame),
}

/// Pipe-delimited data frame, payload not yet split into records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Whether the payload is encrypted.
    pub encrypted: bool,
    /// Transaction id of the feed.
    pub tr_id: String,
    /// Number of records in the payload.
    pub count: usize,
    /// `^`-delimited fields of every record.
    pub payload: String,
}

impl DataFrame {
    /// Decode every execution record in the frame.
    ///
    /// # Errors
    ///
    /// Returns error for other feeds, encrypted payloads, short records, or
    /// unparseable numbers.
    pub fn execution_ticks(&self) -> Result<Vec<Tick>, CodecError> {
        if self.tr_id != EXECUTION_TR_ID {
            return Err(CodecError::UnexpectedTransaction(self.tr_id.clone()));
        }
        if self.encrypted {
            return Err(CodecError::Encrypted(self.tr_id.clone()));
        }

        let fields: Vec<&str> = self.payload.split('^').collect();
        let per_record = if self.count > 1 && fields.len() % self.count == 0 {
            fields.len() / self.count
        } else {
            fields.len()
        };

        fields
            .chunks(per_record.max(1))
            .map(parse_execution_record)
            .collect()
    }
}

fn parse_execution_record(fields: &[&str]) -> Result<Tick, CodecError> {
    if fields.len() <= MIN_EXECUTION_FIELDS {
        return Err(CodecError::TooFewFields {
            expected: MIN_EXECUTION_FIELDS,
            actual: fields.len(),
        });
    }

    let code = fields[FIELD_CODE].trim();
    if code.is_empty() {
        return Err(CodecError::Malformed("empty instrument code".to_string()));
    }

    let price = parse_decimal("price", fields[FIELD_PRICE])?;
    let change = parse_decimal("change rate", fields[FIELD_CHANGE_RATE])?;

    Ok(Tick::new(code, price, change))
}

fn parse_decimal(field: &'static str, raw: &str) -> Result<Decimal, CodecError> {
    let trimmed = raw.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    Decimal::from_str(unsigned).map_err(|_| CodecError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

/// A decoded JSON control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Keepalive probe; `raw` must be sent back unchanged.
    PingPong {
        /// The frame exactly as received.
        raw: String,
    },
    /// Response to a subscribe or unsubscribe request.
    Ack(SubscriptionAck),
    /// Any other control frame.
    Other {
        /// Transaction id from the header.
        tr_id: String,
    },
}

/// Subscription acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAck {
    /// Transaction id the ack refers to.
    pub tr_id: String,
    /// Instrument code, when present.
    pub tr_key: Option<String>,
    /// Whether the upstream accepted the request.
    pub success: bool,
    /// Message code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl SubscriptionAck {
    /// Whether the upstream refused the approval key itself.
    ///
    /// The key has to be re-issued before the next connection attempt.
    #[must_use]
    pub fn is_approval_rejection(&self) -> bool {
        !self.success && self.message.to_ascii_lowercase().contains("approval")
    }
}

/// Decode one raw text frame.
///
/// # Errors
///
/// Returns error if the frame is empty, a malformed data frame, or invalid
/// JSON.
pub fn decode_frame(raw: &str) -> Result<UpstreamFrame, CodecError> {
    let Some(first) = raw.chars().next() else {
        return Err(CodecError::Empty);
    };

    if matches!(first, '0' | '1') {
        return decode_data_frame(raw).map(UpstreamFrame::Data);
    }

    let message: ControlMessage = serde_json::from_str(raw)?;
    let tr_id = message.header.tr_id;

    let frame = if tr_id == PINGPONG_TR_ID {
        ControlFrame::PingPong {
            raw: raw.to_string(),
        }
    } else if let Some(body) = message.body {
        ControlFrame::Ack(SubscriptionAck {
            success: body.rt_cd == "0",
            tr_id,
            tr_key: message.header.tr_key,
            code: body.msg_cd,
            message: body.msg1,
        })
    } else {
        ControlFrame::Other { tr_id }
    };

    Ok(UpstreamFrame::Control(frame))
}

fn decode_data_frame(raw: &str) -> Result<DataFrame, CodecError> {
    let mut parts = raw.splitn(4, '|');
    let (Some(flag), Some(tr_id), Some(count), Some(payload)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CodecError::Malformed(preview(raw)));
    };

    let count = count
        .trim()
        .parse::<usize>()
        .map_err(|_| CodecError::InvalidNumber {
            field: "record count",
            value: count.to_string(),
        })?;

    Ok(DataFrame {
        encrypted: flag == "1",
        tr_id: tr_id.to_string(),
        count,
        payload: payload.to_string(),
    })
}

fn preview(raw: &str) -> String {
    raw.chars().take(50).collect()
}

/// Encode a subscribe or unsubscribe request.
///
/// # Errors
///
/// Returns error if JSON serialization fails.
pub fn encode_subscription(
    approval_key: &ApprovalKey,
    action: SubscriptionAction,
    tr_id: &str,
    code: &str,
) -> Result<String, CodecError> {
    let request = SubscriptionRequest {
        header: RequestHeader {
            approval_key: approval_key.expose(),
            custtype: "P",
            tr_type: action.tr_type(),
            content_type: "utf-8",
        },
        body: RequestBody {
            input: RequestInput { tr_id, tr_key: code },
        },
    };
    Ok(serde_json::to_string(&request)?)
}
