//! `EcuServer`: axum router for device sockets and operator endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ecu_runtime::{Gateway, TransportListener};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::errors::{Result, ServerError};
use crate::health::{banner, health_check};
use crate::metrics::render;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::transport::{CLOSE_GOING_AWAY, WsTransport};
use crate::websocket::{SessionContext, run_ws_session};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session core.
    pub gateway: Arc<Gateway>,
    /// Context handed to every socket task.
    pub sessions: SessionContext,
    /// Prometheus handle for `/metrics` (absent when no recorder is installed).
    pub metrics: Option<PrometheusHandle>,
    /// Server start time, for uptime.
    pub start_time: Instant,
}

/// The southbound server.
pub struct EcuServer {
    config: Arc<ServerConfig>,
    state: AppState,
    shutdown: ShutdownCoordinator,
}

impl EcuServer {
    /// Create a server feeding `gateway` and routing its commands through
    /// `transport`. The gateway must have been started with the same
    /// transport.
    pub fn new(
        config: ServerConfig,
        gateway: Arc<Gateway>,
        transport: Arc<WsTransport>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let config = Arc::new(config);
        let shutdown = ShutdownCoordinator::new();
        let listener: Arc<dyn TransportListener> = gateway.clone();
        let sessions = SessionContext::new(config.clone(), listener, transport, shutdown.token());
        Self {
            config,
            state: AppState {
                gateway,
                sessions,
                metrics,
                start_time: Instant::now(),
            },
            shutdown,
        }
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(&self.config.ws_path, get(ws_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind and serve in the background. Returns the bound address and the
    /// serve task, which finishes once shutdown has been initiated and every
    /// socket task has ended or the shutdown timeout elapsed.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener.local_addr().map_err(ServerError::LocalAddr)?;
        info!(addr = %local, ws_path = %self.config.ws_path, "southbound server listening");

        let app = self.router();
        let token = self.shutdown.token();
        let sessions = self.state.sessions.clone();
        let timeout = self.config.shutdown_timeout;
        let handle = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
            let closing = sessions.transport.close_all(CLOSE_GOING_AWAY, "server shutting down");
            if !sessions.wait_idle(timeout).await {
                warn!(
                    remaining = sessions.active(),
                    "device sockets still open after shutdown timeout"
                );
            }
            info!(closing, "southbound server stopped");
        });
        Ok((local, handle))
    }

    /// Shutdown coordinator. Cancelling it stops accepting connections and
    /// closes every device socket.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Outbound routing table.
    pub fn transport(&self) -> &Arc<WsTransport> {
        &self.state.sessions.transport
    }

    /// Open device sockets, including ones still handshaking.
    pub fn connection_count(&self) -> usize {
        self.state.sessions.active()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    let connected = state.gateway.registry().counts().connected;
    Json(banner(&state.sessions.config.ws_path, connected))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let shutting_down = state.sessions.shutdown.is_cancelled();
    let resp = health_check(
        state.start_time,
        shutting_down,
        state.gateway.registry().counts(),
        state.sessions.transport.connection_count(),
        state.gateway.dispatcher().pending_count(),
    );
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(resp))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if state.sessions.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let limit = state.sessions.config.max_message_bytes;
    let ctx = state.sessions.clone();
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| run_ws_session(socket, peer, ctx))
}
