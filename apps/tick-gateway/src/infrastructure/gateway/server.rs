//! Client WebSocket Server
//!
//! Serves `GET /ws/{client_id}?user_id=...` and bridges each upgraded socket
//! to the [`Gateway`]: a writer task drains the connection's outbound queue,
//! the reader loop feeds text frames to [`Gateway::handle_text`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::manager::Gateway;

/// Query parameters accepted on upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Identity of the connecting user; `guest` when absent.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Build the client-facing router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws/{client_id}", get(upgrade_handler))
        .with_state(gateway)
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(gateway, socket, client_id, params.user_id))
}

async fn serve_socket(
    gateway: Arc<Gateway>,
    socket: WebSocket,
    client_id: String,
    user_id: Option<String>,
) {
    let (conn, mut outbound) = gateway.accept(&client_id, user_id.as_deref());
    let cancel = conn.cancel_token();
    let (mut sink, mut stream) = socket.split();

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_cancel.cancelled() => break,
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        tracing::debug!(error = %e, "Client write failed");
                        break;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        writer_cancel.cancel();
    });

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => gateway.handle_text(&conn, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = conn.id(), error = %e, "Client read failed");
                    break;
                }
            }
        }
    }

    gateway.disconnect(conn.id());
    let _ = writer.await;
}

/// Client WebSocket server.
pub struct GatewayServer {
    port: u16,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
}

impl GatewayServer {
    /// Create a server for `gateway` on `port`.
    #[must_use]
    pub const fn new(port: u16, gateway: Arc<Gateway>, cancel: CancellationToken) -> Self {
        Self {
            port,
            gateway,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `GatewayServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), GatewayServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Client WebSocket server listening");

        axum::serve(listener, router(self.gateway))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| GatewayServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Client WebSocket server stopped");
        Ok(())
    }
}

/// Client WebSocket server errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
