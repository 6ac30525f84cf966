//! Quote Worker Pool
//!
//! Runs blocking [`QuoteFetcher`] calls on Tokio's blocking thread pool,
//! gated by a semaphore so at most `workers` fetches run at once. Requests
//! beyond `workers + queue_limit` are rejected with [`FetchError::QueueFull`]
//! instead of piling up under a slow source. Callers that bound their own
//! concurrency, like the fallback poller, use
//! [`QuoteWorkerPool::fetch_waiting`] and are never rejected.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::application::ports::{FetchError, QuoteFetcher};
use crate::domain::market::Quote;
use crate::infrastructure::metrics;

/// Bounded pool for blocking quote fetches.
pub struct QuoteWorkerPool {
    fetcher: Arc<dyn QuoteFetcher>,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
    workers: usize,
}

impl std::fmt::Debug for QuoteWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteWorkerPool")
            .field("workers", &self.workers)
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Releases a pending slot when the fetch finishes or is abandoned.
struct PendingSlot(Arc<AtomicUsize>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl QuoteWorkerPool {
    /// Create a pool running at most `workers` fetches, with up to
    /// `queue_limit` more waiting.
    #[must_use]
    pub fn new(fetcher: Arc<dyn QuoteFetcher>, workers: usize, queue_limit: usize) -> Self {
        let workers = workers.max(1);
        Self {
            fetcher,
            permits: Arc::new(Semaphore::new(workers)),
            pending: Arc::new(AtomicUsize::new(0)),
            capacity: workers + queue_limit,
            workers,
        }
    }

    /// Fetches allowed to run at once.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Number of fetches running or waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Fetch a quote on a worker thread.
    ///
    /// The queue slot is reserved when this is called, not when the returned
    /// future is first polled. A fetch already running on a worker thread
    /// completes even if the future is dropped; its result is discarded.
    pub fn fetch(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<Quote, FetchError>> + Send + 'static {
        self.run_fetch(self.reserve(), symbol)
    }

    /// Fetch a quote, waiting for a worker however long the queue is.
    ///
    /// Counts toward [`pending`](Self::pending) but is never rejected.
    pub fn fetch_waiting(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<Quote, FetchError>> + Send + 'static {
        self.run_fetch(Ok(self.occupy()), symbol)
    }

    fn run_fetch(
        &self,
        slot: Result<PendingSlot, FetchError>,
        symbol: &str,
    ) -> impl Future<Output = Result<Quote, FetchError>> + Send + 'static {
        let fetcher = Arc::clone(&self.fetcher);
        let permits = Arc::clone(&self.permits);
        let symbol = symbol.to_string();

        async move {
            let _slot = slot?;
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|e| FetchError::Worker(e.to_string()))?;

            let started = Instant::now();
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                fetcher.fetch_quote(&symbol)
            })
            .await
            .map_err(|e| FetchError::Worker(e.to_string()))?;

            metrics::record_fetch_latency(started.elapsed());
            if let Err(e) = &result {
                metrics::record_fetch_error(e.kind());
            }
            result
        }
    }

    fn occupy(&self) -> PendingSlot {
        self.pending.fetch_add(1, Ordering::AcqRel);
        PendingSlot(Arc::clone(&self.pending))
    }

    fn reserve(&self) -> Result<PendingSlot, FetchError> {
        let previous = self.pending.fetch_add(1, Ordering::AcqRel);
        let slot = PendingSlot(Arc::clone(&self.pending));
        if previous >= self.capacity {
            metrics::record_fetch_error(FetchError::QueueFull.kind());
            return Err(FetchError::QueueFull);
        }
        Ok(slot)
    }
}
