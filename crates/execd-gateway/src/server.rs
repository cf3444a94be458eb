use std::net::SocketAddr;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::{ChannelGateway, HealthReport};
use crate::protocol;

#[derive(Debug, Clone)]
pub struct GatewayHostConfig {
    pub bind_addr: SocketAddr,
}

/// Serves a [`ChannelGateway`] over HTTP: `GET /ws` upgrades to a WebSocket
/// carrying JSON text frames, `GET /health` reports runtime and queue state.
pub struct GatewayHost {
    gateway: ChannelGateway,
    config: GatewayHostConfig,
    local_addr: Option<SocketAddr>,
    server_handle: Option<JoinHandle<Result<()>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl GatewayHost {
    pub fn new(gateway: ChannelGateway, config: GatewayHostConfig) -> Self {
        Self {
            gateway,
            config,
            local_addr: None,
            server_handle: None,
            shutdown_tx: None,
        }
    }

    pub fn router(gateway: ChannelGateway) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(gateway)
    }

    /// Binds and starts serving. Returns the bound address, which differs from
    /// the configured one when port 0 was requested.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.server_handle.is_some() {
            return Err(GatewayError::InvalidState {
                reason: "Server is already running".to_string(),
            });
        }

        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(GatewayError::Server)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = Self::router(self.gateway.clone());

        info!("Starting gateway on {}", local_addr);

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                    info!("Gateway shutdown signal received");
                })
                .await
                .map_err(GatewayError::Server)
        });

        self.server_handle = Some(server_handle);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        info!("Gateway listening on {}", local_addr);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn gateway(&self) -> &ChannelGateway {
        &self.gateway
    }

    pub async fn shutdown(mut self) -> Result<()> {
        info!("Initiating gateway shutdown");

        // Ends every open socket loop before the listener drains.
        self.gateway.shutdown();

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(server_handle) = self.server_handle.take() {
            match server_handle.await {
                Ok(Ok(())) => info!("Gateway shut down successfully"),
                Ok(Err(e)) => error!("Gateway error during shutdown: {}", e),
                Err(e) => error!("Failed to join gateway task: {}", e),
            }
        }

        Ok(())
    }

    pub async fn wait(&mut self) -> Result<()> {
        if let Some(server_handle) = &mut self.server_handle {
            match server_handle.await {
                Ok(result) => result,
                Err(e) => Err(GatewayError::InvalidState {
                    reason: format!("Server task panicked: {e}"),
                }),
            }
        } else {
            Err(GatewayError::InvalidState {
                reason: "Server is not running".to_string(),
            })
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<ChannelGateway>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, gateway))
}

async fn health_handler(
    State(gateway): State<ChannelGateway>,
) -> std::result::Result<Json<HealthReport>, (StatusCode, String)> {
    gateway
        .health()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

async fn serve_socket(socket: WebSocket, gateway: ChannelGateway) {
    let mut connection = match gateway.connect() {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "Refusing WebSocket client");
            return;
        }
    };
    let client = connection.client_id();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = connection.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                let text = match protocol::encode(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(client_id = %client, error = %e, "Failed to encode message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = gateway.handle_frame(client, text.as_str()).await {
                        error!(client_id = %client, error = %e, "Gateway failed handling frame");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client_id = %client, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    let _ = sink.close().await;
    debug!(client_id = %client, "WebSocket closed");
}
