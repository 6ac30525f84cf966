//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports, plus the network
//! surfaces the gateway exposes.

/// KIS real-time stream client: codec, approval keys, per-user bridges.
pub mod kis;

/// Client-facing WebSocket gateway.
pub mod gateway;

/// HTTP quote source used by the fallback poller.
pub mod quotes;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
