use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json,
};
use chrono::Utc;
use futures_util::{future::ready, SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tidewatch_proto::{Handshake, ServerEvent, Status, PROTOCOL_VERSION, SERVER_NAME};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    connection::{Connection, PeerRole, TransportError},
    files::FileService,
    registry::ConnectionRegistry,
    router::{PeerSession, PingHandler, Router},
};

pub struct AppState {
    config: ServerConfig,
    registry: ConnectionRegistry,
    router: Router,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<Self> {
        let files = FileService::new(&config.root, config.max_stream_bytes)
            .with_context(|| format!("invalid root directory {}", config.root.display()))?;
        let router = Router::new(Arc::new(files), config.camera.source())
            .with_handler("PING", PingHandler);
        Ok(Self::with_router(config, router, metrics))
    }

    /// State around a prebuilt router, e.g. one with extra handlers.
    pub fn with_router(
        config: ServerConfig,
        router: Router,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            router,
            metrics,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    role: PeerRole,
}

pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serves until `shutdown` resolves, then tells every console, waits out the
/// grace period and closes all connections.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(state);
    let registry = state.registry.clone();
    let grace = state.config.shutdown_grace;
    let app = build_router(Arc::clone(&state));

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, camera = state.router.camera_name(), "tidewatch listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let notified = registry
                .send_to_all(PeerRole::Console, &Status::info("Server shutting down"))
                .await;
            info!(
                notified,
                grace_seconds = grace.as_secs(),
                "shutdown signal received; closing connections after grace period"
            );
            tokio::time::sleep(grace).await;
            registry.close_all().await;
        })
        .await
        .context("server shutdown with error")
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "server": SERVER_NAME,
        "version": PROTOCOL_VERSION,
        "connections": state.registry.len(),
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, query.role))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, role: PeerRole) {
    let (ws_tx, mut ws_rx) = socket.split();
    let sink = ws_tx
        .sink_map_err(|err| TransportError::Send(err.to_string()))
        .with(|text: String| ready(Ok::<_, TransportError>(Message::Text(text))));
    let connection = Connection::new(Uuid::new_v4(), role, sink);
    let connection_id = connection.id();

    let active = state.registry.register(Arc::clone(&connection));
    counter!("tidewatch_connections_opened_total", 1, "role" => role_label(role));
    gauge!("tidewatch_active_connections", active as f64);
    info!(%connection_id, %role, active, "connection established");

    let handshake = ServerEvent::Handshake(Handshake {
        server_name: SERVER_NAME.into(),
        version: PROTOCOL_VERSION.into(),
        timestamp: Utc::now(),
        connection_id,
    });

    if connection.send(&handshake).await.is_ok() {
        receive_loop(&state, &connection, &mut ws_rx).await;
    }

    state.registry.unregister(connection_id);
    connection.close().await;
    counter!("tidewatch_connections_closed_total", 1, "role" => role_label(role));
    gauge!("tidewatch_active_connections", state.registry.len() as f64);
    info!(%connection_id, "connection closed");
}

async fn receive_loop<S>(state: &AppState, connection: &Arc<Connection>, ws_rx: &mut S)
where
    S: futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let connection_id = connection.id();
    let session = PeerSession::new(Arc::clone(connection));
    let lifetime = connection.lifetime().clone();

    loop {
        let frame = tokio::select! {
            _ = lifetime.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(%connection_id, "ignoring non-UTF-8 binary message");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!(
                    %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(%connection_id, error = %err, "error receiving message");
                break;
            }
            None => break,
        };

        counter!("tidewatch_messages_received_total", 1);
        let result = if connection.role() == PeerRole::Observer {
            connection
                .send(&Status::error("Observers cannot issue commands"))
                .await
        } else {
            state.router.handle_message(&session, &text).await
        };
        if let Err(err) = result {
            debug!(%connection_id, error = %err, "failed to send reply");
        }
    }
}

fn role_label(role: PeerRole) -> &'static str {
    match role {
        PeerRole::Console => "console",
        PeerRole::Observer => "observer",
    }
}
