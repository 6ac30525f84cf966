//! Quote Fetcher Port (Driven Port)
//!
//! Interface for fetching a single quote snapshot. Implementations are
//! allowed to block; callers run them on the quote worker pool.

use crate::domain::market::Quote;

/// Blocking quote snapshot source.
///
/// Must be safe to call concurrently from several worker threads.
pub trait QuoteFetcher: Send + Sync {
    /// Fetch the latest quote for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns error if the symbol is unsupported or the source fails.
    fn fetch_quote(&self, symbol: &str) -> Result<Quote, FetchError>;
}

/// Quote fetch error.
///
/// Fetch errors are per symbol and never affect sibling fetches.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The source has no data for this symbol.
    #[error("Unsupported symbol: {symbol}")]
    Unsupported {
        /// Symbol that was requested.
        symbol: String,
    },

    /// The upstream source failed.
    #[error("Quote source error for {symbol}: {message}")]
    Source {
        /// Symbol that was requested.
        symbol: String,
        /// Error details.
        message: String,
    },

    /// Too many fetches are already waiting for a worker.
    #[error("Quote worker queue is full")]
    QueueFull,

    /// The worker running the fetch died.
    #[error("Quote worker failed: {0}")]
    Worker(String),
}

impl FetchError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unsupported { .. } => "unsupported",
            Self::Source { .. } => "source",
            Self::QueueFull => "queue_full",
            Self::Worker(_) => "worker",
        }
    }
}
