//! Tick Gateway Binary
//!
//! Starts the client WebSocket gateway, the fallback poller, and the health
//! server. Upstream KIS sessions start on demand when clients authenticate.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin tick-gateway
//! ```
//!
//! # Environment Variables
//!
//! All optional.
//!
//! - `TICK_GATEWAY_WS_PORT`: Client WebSocket port (default: 8000)
//! - `TICK_GATEWAY_HEALTH_PORT`: Health and metrics port (default: 8082)
//! - `TICK_GATEWAY_CLIENT_HEARTBEAT_SECS`: Server ping interval (default: 30)
//! - `TICK_GATEWAY_CLIENT_QUEUE`: Per-connection outbound queue (default: 256)
//! - `TICK_GATEWAY_POLL_INTERVAL_MS`: Fallback poll interval (default: 1000)
//! - `TICK_GATEWAY_FETCH_WORKERS`: Blocking fetch workers (default: 10)
//! - `TICK_GATEWAY_FETCH_QUEUE`: Fetches allowed to wait (default: 100)
//! - `TICK_GATEWAY_QUOTE_URL`: Quote source base URL
//! - `KIS_WS_URL`, `KIS_REST_URL`: Upstream endpoints
//! - `KIS_MAX_RECONNECT_ATTEMPTS`: Failures before a session is reported failed (default: 10)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: Tracing export
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tick_gateway::infrastructure::telemetry;
use tick_gateway::{
    FallbackPoller, Gateway, GatewayConfig, GatewayOptions, GatewayServer, HealthServer,
    HealthServerState, KisApprovalClient, NaverQuoteFetcher, QuoteSink, QuoteWorkerPool,
    SessionMultiplexer, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time allowed for servers and bridges to wind down after a signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting tick gateway");

    let _metrics_handle = init_metrics();

    let config = GatewayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Upstream sessions, created lazily per authenticated user
    let authenticator = Arc::new(
        KisApprovalClient::new(config.upstream.rest_url.clone())
            .context("building approval client")?,
    );
    let sessions = Arc::new(SessionMultiplexer::new(
        config.upstream.bridge_config(),
        authenticator,
        shutdown_token.child_token(),
    ));

    // Blocking quote fetches for the poller and initial snapshots
    let fetcher = Arc::new(
        NaverQuoteFetcher::new(config.poller.quote_url.clone())
            .context("building quote fetcher")?,
    );
    let quotes = Arc::new(QuoteWorkerPool::new(
        fetcher,
        config.poller.workers,
        config.poller.queue_limit,
    ));

    let gateway = Gateway::new(
        GatewayOptions::from(&config.client),
        Arc::clone(&sessions),
        Arc::clone(&quotes),
        shutdown_token.child_token(),
    );

    // Fallback poller
    let poller = FallbackPoller::new(
        Arc::clone(&gateway) as Arc<dyn QuoteSink>,
        quotes,
        config.poller.interval,
    );
    let poller_cancel = shutdown_token.clone();
    let poller_task = tokio::spawn(async move {
        poller.run(poller_cancel).await;
    });

    // Client WebSocket server
    let ws_server = GatewayServer::new(
        config.server.ws_port,
        Arc::clone(&gateway),
        shutdown_token.clone(),
    );
    let ws_task = tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "Client WebSocket server error");
        }
    });

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&gateway),
        shutdown_token.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Tick gateway ready");

    await_shutdown(shutdown_token).await;

    sessions.shutdown();
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = poller_task.await;
        let _ = ws_task.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out with tasks still running"
        );
    }

    tracing::info!("Tick gateway stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        poll_interval_ms = config.poller.interval.as_millis(),
        fetch_workers = config.poller.workers,
        max_reconnect_attempts = config.upstream.max_reconnect_attempts,
        "Configuration loaded"
    );
    tracing::debug!(
        kis_ws_url = %config.upstream.ws_url,
        kis_rest_url = %config.upstream.rest_url,
        quote_url = %config.poller.quote_url,
        "Upstream endpoints"
    );
}

/// Load a .env file from the current directory or the nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Wait for SIGTERM or SIGINT, then cancel `shutdown_token`.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
