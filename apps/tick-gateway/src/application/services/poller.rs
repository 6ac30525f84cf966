//! Fallback Poller
//!
//! Guarantees a minimum update cadence: once per interval it snapshots every
//! subscribed symbol, fetches each on the [`QuoteWorkerPool`], and publishes
//! whatever succeeded. At most one fetch per pool worker is in flight, so a
//! snapshot larger than the pool queue is worked through rather than
//! rejected. Upstream pushes simply arrive earlier; the poller does
//! not know or care whether a bridge is connected.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::QuoteWorkerPool;
use crate::application::ports::{FetchError, QuoteSink};
use crate::domain::market::Quote;
use crate::infrastructure::metrics::{self, TickSource};

/// Outcome of one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Symbols snapshotted at the start of the cycle.
    pub symbols: usize,
    /// Symbols whose quote was fetched and published.
    pub published: usize,
    /// Symbols whose fetch failed.
    pub failed: usize,
    /// Connections that were queued an update.
    pub deliveries: usize,
}

/// Fixed-interval quote refresher.
pub struct FallbackPoller {
    sink: Arc<dyn QuoteSink>,
    pool: Arc<QuoteWorkerPool>,
    interval: Duration,
}

impl FallbackPoller {
    /// Create a poller publishing to `sink` every `interval`.
    #[must_use]
    pub fn new(sink: Arc<dyn QuoteSink>, pool: Arc<QuoteWorkerPool>, interval: Duration) -> Self {
        Self {
            sink,
            pool,
            interval,
        }
    }

    /// Run one cycle: fetch every subscribed symbol and publish successes.
    ///
    /// Each symbol is fetched independently; one failure never affects the
    /// others.
    pub async fn poll_once(&self) -> PollSummary {
        let symbols = self.sink.subscribed_symbols();
        let mut summary = PollSummary {
            symbols: symbols.len(),
            ..PollSummary::default()
        };
        if symbols.is_empty() {
            return summary;
        }

        let mut remaining = symbols.into_iter();
        let mut fetches = JoinSet::new();
        for symbol in remaining.by_ref().take(self.pool.workers()) {
            self.spawn_fetch(&mut fetches, symbol);
        }

        while let Some(joined) = fetches.join_next().await {
            if let Some(symbol) = remaining.next() {
                self.spawn_fetch(&mut fetches, symbol);
            }

            match joined {
                Ok((symbol, Ok(quote))) => {
                    let quote = quote.with_symbol(symbol.as_str());
                    summary.deliveries += self.sink.publish_quote(&symbol, &quote);
                    summary.published += 1;
                    metrics::record_tick_received(TickSource::Poller);
                }
                Ok((symbol, Err(e))) => {
                    summary.failed += 1;
                    tracing::debug!(symbol = %symbol, error = %e, "Fallback fetch failed");
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(error = %e, "Fallback fetch task panicked");
                }
            }
        }

        summary
    }

    fn spawn_fetch(
        &self,
        fetches: &mut JoinSet<(String, Result<Quote, FetchError>)>,
        symbol: String,
    ) {
        let fetch = self.pool.fetch_waiting(&symbol);
        fetches.spawn(async move { (symbol, fetch.await) });
    }

    /// Poll until `cancel` fires.
    ///
    /// Missed intervals are skipped so a slow cycle never triggers a burst.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(interval_ms = self.interval.as_millis(), "Fallback poller started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                summary = self.poll_once() => {
                    if summary.failed > 0 {
                        tracing::debug!(
                            symbols = summary.symbols,
                            published = summary.published,
                            failed = summary.failed,
                            "Fallback poll cycle had failures"
                        );
                    }
                }
            }
        }

        tracing::info!("Fallback poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::QuoteFetcher;

    struct FixedFetcher;

    impl QuoteFetcher for FixedFetcher {
        fn fetch_quote(&self, symbol: &str) -> Result<Quote, FetchError> {
            if symbol == "BROKEN" {
                return Err(FetchError::Source {
                    symbol: symbol.to_string(),
                    message: "upstream 500".to_string(),
                });
            }
            Ok(Quote {
                symbol: "ignored".to_string(),
                price: "75,000".to_string(),
                change: "+0.50%".to_string(),
                name: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        symbols: Vec<String>,
        published: Mutex<HashMap<String, Vec<Quote>>>,
    }

    impl QuoteSink for RecordingSink {
        fn subscribed_symbols(&self) -> Vec<String> {
            self.symbols.clone()
        }

        fn publish_quote(&self, symbol: &str, quote: &Quote) -> usize {
            self.published
                .lock()
                .entry(symbol.to_string())
                .or_default()
                .push(quote.clone());
            1
        }
    }

    fn poller(sink: Arc<RecordingSink>, interval: Duration) -> FallbackPoller {
        let pool = Arc::new(QuoteWorkerPool::new(Arc::new(FixedFetcher), 10, 100));
        FallbackPoller::new(sink, pool, interval)
    }

    #[tokio::test]
    async fn one_failure_does_not_block_other_symbols() {
        let sink = Arc::new(RecordingSink {
            symbols: vec!["005930".into(), "BROKEN".into(), "AAPL".into()],
            ..RecordingSink::default()
        });

        let summary = poller(Arc::clone(&sink), Duration::from_secs(1))
            .poll_once()
            .await;

        assert_eq!(
            summary,
            PollSummary {
                symbols: 3,
                published: 2,
                failed: 1,
                deliveries: 2,
            }
        );
        let published = sink.published.lock();
        assert!(published.contains_key("005930"));
        assert!(published.contains_key("AAPL"));
        assert!(!published.contains_key("BROKEN"));
    }

    #[tokio::test]
    async fn published_quote_is_keyed_by_subscription_symbol() {
        let sink = Arc::new(RecordingSink {
            symbols: vec!["005930.KS".into()],
            ..RecordingSink::default()
        });

        poller(Arc::clone(&sink), Duration::from_secs(1))
            .poll_once()
            .await;

        let published = sink.published.lock();
        assert_eq!(published["005930.KS"][0].symbol, "005930.KS");
    }

    struct SlowFetcher;

    impl QuoteFetcher for SlowFetcher {
        fn fetch_quote(&self, symbol: &str) -> Result<Quote, FetchError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(Quote {
                symbol: symbol.to_string(),
                price: "1".to_string(),
                change: "+0.00%".to_string(),
                name: None,
            })
        }
    }

    #[tokio::test]
    async fn snapshot_larger_than_pool_is_fully_published() {
        let symbols: Vec<String> = (0..150).map(|i| format!("{i:06}")).collect();
        let sink = Arc::new(RecordingSink {
            symbols: symbols.clone(),
            ..RecordingSink::default()
        });
        let pool = Arc::new(QuoteWorkerPool::new(Arc::new(SlowFetcher), 10, 100));
        let poller = FallbackPoller::new(
            Arc::clone(&sink) as Arc<dyn QuoteSink>,
            Arc::clone(&pool),
            Duration::from_secs(1),
        );

        let summary = poller.poll_once().await;

        assert_eq!(summary.published, 150);
        assert_eq!(summary.failed, 0);
        assert_eq!(pool.pending(), 0);
        let published = sink.published.lock();
        assert!(symbols.iter().all(|symbol| published.contains_key(symbol)));
    }

    #[tokio::test]
    async fn empty_snapshot_is_a_cheap_noop() {
        let sink = Arc::new(RecordingSink::default());

        let summary = poller(sink, Duration::from_secs(1)).poll_once().await;

        assert_eq!(summary, PollSummary::default());
    }

    #[tokio::test]
    async fn every_subscribed_symbol_is_refreshed_each_interval() {
        let sink = Arc::new(RecordingSink {
            symbols: vec!["005930".into(), "AAPL".into()],
            ..RecordingSink::default()
        });
        let poller = Arc::new(poller(Arc::clone(&sink), Duration::from_millis(20)));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let poller = Arc::clone(&poller);
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        let published = sink.published.lock();
        assert!(published["005930"].len() >= 3);
        assert!(published["AAPL"].len() >= 3);
    }
}
