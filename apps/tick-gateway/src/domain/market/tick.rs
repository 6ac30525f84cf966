//! Ticks and Quote Snapshots

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single normalized price update for one instrument.
///
/// Ticks are "latest value" snapshots: they are forwarded, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tick {
    /// Symbol as reported by the source (bare code for upstream ticks).
    pub symbol: String,
    /// Last traded price.
    pub price: Decimal,
    /// Change versus previous close, in percent.
    pub change_percent: Decimal,
    /// When the gateway received the tick.
    pub received_at: DateTime<Utc>,
}

impl Tick {
    /// Create a tick stamped with the current time.
    #[must_use]
    pub fn new(symbol: impl Into<String>, price: Decimal, change_percent: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            change_percent,
            received_at: Utc::now(),
        }
    }

    /// Render the tick in the client-facing quote shape.
    #[must_use]
    pub fn to_quote(&self) -> Quote {
        Quote {
            symbol: self.symbol.clone(),
            price: format_price(self.price),
            change: format_change_percent(self.change_percent),
            name: None,
        }
    }
}

/// Quote snapshot as delivered in `update` frames.
///
/// Prices are pre-formatted strings (`"75,000"`, `"+0.50%"`) because that is
/// what clients render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Symbol the quote is for.
    pub symbol: String,
    /// Formatted last price.
    pub price: String,
    /// Formatted percent change.
    pub change: String,
    /// Display name, when the source knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Quote {
    /// Re-key the quote under another symbol spelling.
    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = symbol.into();
        self
    }
}

/// Format a price with thousands separators, dropping trailing zeros.
#[must_use]
pub fn format_price(price: Decimal) -> String {
    let text = price.normalize().abs().to_string();
    let (integer, fraction) = match text.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (text.as_str(), None),
    };

    let mut out = String::with_capacity(text.len() + integer.len() / 3 + 1);
    if price.is_sign_negative() && !price.is_zero() {
        out.push('-');
    }
    for (i, digit) in integer.chars().enumerate() {
        if i > 0 && (integer.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(digit);
    }
    if let Some(fraction) = fraction {
        out.push('.');
        out.push_str(fraction);
    }
    out
}

/// Format a percent change as a signed two-decimal string (`+0.50%`).
#[must_use]
pub fn format_change_percent(change: Decimal) -> String {
    let rounded = change.round_dp(2);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() {
        "-"
    } else {
        "+"
    };
    format!("{sign}{:.2}%", rounded.abs())
}
