//! Application Services
//!
//! Services that coordinate ports without doing I/O themselves.
//!
//! - `QuoteWorkerPool`: bounded executor for blocking quote fetches
//! - `FallbackPoller`: fixed-cadence quote refresh for every subscribed symbol

mod poller;
mod quotes;

pub use poller::{FallbackPoller, PollSummary};
pub use quotes::QuoteWorkerPool;
