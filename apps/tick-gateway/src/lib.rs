#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Tick Gateway - Real-Time Price Fan-Out
//!
//! A WebSocket service that pushes live prices to many browser clients.
//! Users who present broker credentials get their own KIS real-time feed;
//! everyone else, and every symbol the feed does not cover, is served by a
//! fixed-cadence fallback poller.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Ticks, quotes, symbol canonicalization, subscription index
//! - **Application**: Ports, the quote worker pool, and the fallback poller
//! - **Infrastructure**: Adapters and external integrations
//!   - `kis`: upstream codec, approval keys, bridges, session multiplexer
//!   - `gateway`: client protocol, connections, fan-out, WebSocket server
//!   - `quotes`: HTTP quote source
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! KIS WS (user A) ──► Bridge A ──┐
//! KIS WS (user B) ──► Bridge B ──┼──► Gateway ──► /ws/{client_id} ──► clients
//! Quote source ─► Poller ────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market types and subscription bookkeeping with no I/O.
pub mod domain;

/// Application layer - Ports and the services built on them.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{CanonicalSymbol, Exchange, Quote, Tick, canonicalize};
pub use domain::subscription::{ConnectionId, SubscriptionIndex, SubscriptionStats};

// Application services and ports
pub use application::ports::{
    ApprovalKey, AuthError, BrokerCredentials, FetchError, QuoteFetcher, QuoteSink, TickObserver,
    UpstreamAuthenticator,
};
pub use application::services::{FallbackPoller, PollSummary, QuoteWorkerPool};

// Infrastructure config
pub use infrastructure::config::{
    ClientSettings, ConfigError, GatewayConfig, PollerSettings, ServerSettings, UpstreamSettings,
};

// Upstream
pub use infrastructure::kis::{
    BridgeConfig, BridgeState, KisApprovalClient, SessionHandler, SessionMultiplexer,
    UpstreamBridge,
};

// Client gateway
pub use infrastructure::gateway::{
    ClientMessage, Gateway, GatewayOptions, GatewayServer, GatewayServerError, GatewayStats,
    ServerMessage,
};

// Quote source
pub use infrastructure::quotes::NaverQuoteFetcher;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
