//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Ticks**: Upstream and fallback ticks received
//! - **Messages**: Frames queued to and dropped for clients
//! - **Connections**: Client connections and upstream sessions
//! - **Upstream**: Reconnects, transport errors, and decode errors
//! - **Quotes**: Fallback fetch latency and failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "tick_gateway_ticks_received_total",
        "Total ticks received by source"
    );
    describe_counter!(
        "tick_gateway_messages_sent_total",
        "Total frames queued to client connections"
    );
    describe_counter!(
        "tick_gateway_messages_dropped_total",
        "Total frames dropped due to slow clients"
    );

    describe_gauge!(
        "tick_gateway_client_connections",
        "Number of connected WebSocket clients"
    );
    describe_gauge!(
        "tick_gateway_upstream_sessions",
        "Number of per-user upstream sessions"
    );

    describe_counter!(
        "tick_gateway_upstream_reconnects_total",
        "Total upstream reconnection attempts"
    );
    describe_counter!(
        "tick_gateway_upstream_errors_total",
        "Total upstream connection errors by type"
    );
    describe_counter!(
        "tick_gateway_decode_errors_total",
        "Total upstream frames that failed to decode"
    );
    describe_counter!(
        "tick_gateway_session_failures_total",
        "Total sessions that exhausted their reconnect attempts"
    );

    describe_counter!(
        "tick_gateway_fetch_errors_total",
        "Total failed quote fetches by kind"
    );
    describe_histogram!(
        "tick_gateway_fetch_duration_seconds",
        "Time spent in a single blocking quote fetch"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Where a tick came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    /// Per-user upstream bridge push.
    Bridge,
    /// Fallback poller fetch.
    Poller,
}

impl TickSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Poller => "poller",
        }
    }
}

/// Record a tick received from a source.
pub fn record_tick_received(source: TickSource) {
    counter!(
        "tick_gateway_ticks_received_total",
        "source" => source.as_str()
    )
    .increment(1);
}

/// Record frames queued to clients.
pub fn record_messages_sent(message_type: &'static str, count: u64) {
    counter!(
        "tick_gateway_messages_sent_total",
        "message_type" => message_type
    )
    .increment(count);
}

/// Record frames dropped for slow clients.
pub fn record_messages_dropped(message_type: &'static str, count: u64) {
    counter!(
        "tick_gateway_messages_dropped_total",
        "message_type" => message_type
    )
    .increment(count);
}

/// Update the connected client count.
pub fn set_client_connections(count: f64) {
    gauge!("tick_gateway_client_connections").set(count);
}

/// Update the upstream session count.
pub fn set_upstream_sessions(count: f64) {
    gauge!("tick_gateway_upstream_sessions").set(count);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("tick_gateway_upstream_reconnects_total").increment(1);
}

/// Record an upstream connection error.
pub fn record_upstream_error(error_type: &'static str) {
    counter!(
        "tick_gateway_upstream_errors_total",
        "error_type" => error_type
    )
    .increment(1);
}

/// Record an upstream frame that failed to decode.
pub fn record_decode_error() {
    counter!("tick_gateway_decode_errors_total").increment(1);
}

/// Record a session that gave up reconnecting.
pub fn record_session_failure() {
    counter!("tick_gateway_session_failures_total").increment(1);
}

/// Record a failed quote fetch.
pub fn record_fetch_error(kind: &'static str) {
    counter!(
        "tick_gateway_fetch_errors_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record how long a blocking quote fetch took.
pub fn record_fetch_latency(duration: Duration) {
    histogram!("tick_gateway_fetch_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_source_as_str() {
        assert_eq!(TickSource::Bridge.as_str(), "bridge");
        assert_eq!(TickSource::Poller.as_str(), "poller");
    }

    #[test]
    fn recording_without_recorder_is_harmless() {
        record_tick_received(TickSource::Bridge);
        record_messages_dropped("update", 1);
        record_fetch_latency(Duration::from_millis(5));
    }
}
