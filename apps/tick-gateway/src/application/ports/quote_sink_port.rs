//! Quote Sink Port (Driver Port)
//!
//! What the fallback poller needs from the fan-out side, plus the observer
//! hook exposed to collaborators outside the core.

use crate::domain::market::{Quote, Tick};

/// Destination for polled quotes.
pub trait QuoteSink: Send + Sync {
    /// Every symbol key with at least one subscribed connection.
    fn subscribed_symbols(&self) -> Vec<String>;

    /// Push a quote to every connection subscribed to `symbol`.
    ///
    /// Returns the number of connections the quote was queued for.
    fn publish_quote(&self, symbol: &str, quote: &Quote) -> usize;
}

/// Observer invoked for every upstream tick delivered for a user.
///
/// The core does not depend on what the observer does with it.
pub trait TickObserver: Send + Sync {
    /// Called once per decoded upstream tick.
    fn on_tick(&self, user_id: &str, symbol: &str, tick: &Tick);
}
