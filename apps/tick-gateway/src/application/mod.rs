//! Application Layer - Port definitions and the services built on them.
//!
//! This layer contains the quote worker pool and the fallback poller, plus
//! the port interfaces the infrastructure adapters implement.

/// Port interfaces for quote sources, authentication, and fan-out.
pub mod ports;

/// Quote worker pool and fallback poller.
pub mod services;
