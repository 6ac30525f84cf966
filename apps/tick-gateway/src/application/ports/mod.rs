//! Port Interfaces
//!
//! Contracts between the tick distribution core and the systems around it.
//!
//! ## Driven Ports (Outbound)
//!
//! - `QuoteFetcher`: blocking single-symbol quote snapshot
//! - `UpstreamAuthenticator`: exchanges broker credentials for an approval key
//!
//! ## Driver Ports (Inbound)
//!
//! - `QuoteSink`: where the fallback poller reads symbols from and publishes to
//! - `TickObserver`: callback for collaborators that want every delivered tick

mod quote_fetcher_port;
mod quote_sink_port;
mod upstream_auth_port;

pub use quote_fetcher_port::{FetchError, QuoteFetcher};
pub use quote_sink_port::{QuoteSink, TickObserver};
pub use upstream_auth_port::{ApprovalKey, AuthError, BrokerCredentials, UpstreamAuthenticator};

#[cfg(test)]
pub use upstream_auth_port::MockUpstreamAuthenticator;
