//! Quote Source Adapters
//!
//! Production implementation of the [`QuoteFetcher`] port used by the quote
//! worker pool.
//!
//! [`QuoteFetcher`]: crate::application::ports::QuoteFetcher

mod naver;

pub use naver::{DEFAULT_QUOTE_URL, NaverQuoteFetcher, QuoteClientError};
