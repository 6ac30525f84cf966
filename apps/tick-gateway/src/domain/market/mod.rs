//! Market Data Types
//!
//! Core domain types for price distribution: normalized ticks coming from the
//! upstream feed, the quote snapshot shape sent to clients, and the single
//! place where symbol spellings are canonicalized.

mod symbol;
mod tick;

pub use symbol::{CanonicalSymbol, Exchange, canonicalize};
pub use tick::{Quote, Tick, format_change_percent, format_price};
