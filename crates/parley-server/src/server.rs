//! `ParleyServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{FromRef, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use parley_broker::{Broker, BrokerError};
use parley_core::topics::ALL_USERS_PATTERN;
use parley_core::{Envelope, UserId};
use parley_store::{Database, MessageRepo};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{AuthUser, TokenService};
use crate::bridge::BrokerBridge;
use crate::config::{ConnectionConfig, ServerConfig, MAX_HISTORY_LIMIT};
use crate::connection;
use crate::delivery::DeliveryService;
use crate::error::ApiError;
use crate::health::{self, HealthResponse};
use crate::hub::{ConnectionHandle, Hub};
use crate::shutdown::ShutdownCoordinator;

/// Errors starting the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address is taken or not permitted.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    /// Listener introspection failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The bridge could not subscribe to the broker.
    #[error("broker subscription failed: {0}")]
    Broker(#[from] BrokerError),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry.
    pub hub: Hub,
    /// Persist-then-publish for outgoing messages.
    pub delivery: Arc<DeliveryService>,
    /// Bearer token verification.
    pub tokens: TokenService,
    pub config: Arc<ServerConfig>,
    /// For `/health` uptime.
    pub start_time: Instant,
    /// Present when the global Prometheus recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl FromRef<AppState> for TokenService {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

/// Build the Axum router with all routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/chat/ws", get(ws_handler))
        .route("/api/chat/messages", post(send_message_handler))
        .route("/api/chat/messages/{user_id}", get(history_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The parley server: registry actor, broker bridge and HTTP surface.
pub struct ParleyServer {
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ParleyServer {
    /// Start the registry and the bridge. Nothing listens until [`listen`](Self::listen).
    pub async fn new(
        config: ServerConfig,
        db: Database,
        broker: Arc<dyn Broker>,
        tokens: TokenService,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, ServerError> {
        let shutdown = Arc::new(ShutdownCoordinator::new());

        let (hub, hub_task) = Hub::spawn(config.hub, shutdown.token());
        shutdown.track("hub", hub_task);

        let subscription = broker.psubscribe(ALL_USERS_PATTERN).await?;
        let bridge = BrokerBridge::new(hub.clone(), subscription);
        let token = shutdown.token();
        shutdown.track(
            "bridge",
            tokio::spawn(async move {
                let _stats = bridge.run(token).await;
            }),
        );

        let delivery = DeliveryService::new(MessageRepo::new(db), broker, config.max_content_len);
        let state = AppState {
            hub,
            delivery: Arc::new(delivery),
            tokens,
            config: Arc::new(config),
            start_time: Instant::now(),
            metrics,
        };
        Ok(Self { state, shutdown })
    }

    /// Router over this server's state, for in-process tests.
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Handle to the connection registry.
    pub fn hub(&self) -> &Hub {
        &self.state.hub
    }

    /// Coordinator owning the registry, bridge and HTTP tasks.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen(self) -> Result<RunningServer, ServerError> {
        let addr = self.state.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let app = self.router();
        let token = self.shutdown.token();
        let http = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server failed");
            }
        });
        self.shutdown.track("http", http);

        info!(%local_addr, "parley server listening");
        Ok(RunningServer {
            local_addr,
            hub: self.state.hub.clone(),
            timeout: self.state.config.shutdown_timeout,
            shutdown: self.shutdown,
        })
    }
}

/// Handle to a listening server.
pub struct RunningServer {
    local_addr: SocketAddr,
    hub: Hub,
    timeout: std::time::Duration,
    shutdown: Arc<ShutdownCoordinator>,
}

impl RunningServer {
    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the connection registry.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Stop accepting requests, stop the registry and bridge, and wait for them.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.shutdown(self.timeout).await;
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let counters = match (state.hub.connection_count().await, state.hub.online_users().await) {
        (Ok(connections), Ok(users)) => Some((connections, users)),
        _ => None,
    };
    Json(health::health_check(state.start_time, counters))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => ApiError::new(StatusCode::NOT_FOUND, "not_found", "metrics are disabled")
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct WsParams {
    device: Option<String>,
}

/// GET /api/chat/ws
///
/// Authentication runs before the upgrade check.
async fn ws_handler(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let device = params.device.filter(|d| !d.trim().is_empty());
    let config = state.config.connection;
    let hub = state.hub.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, hub, user, device, config))
}

async fn handle_socket(
    socket: WebSocket,
    hub: Hub,
    user: UserId,
    device: Option<String>,
    config: ConnectionConfig,
) {
    let (handle, queue) = ConnectionHandle::new(user, device, config.queue_capacity);
    let (sink, stream) = socket.split();
    let _reason = connection::run_connection(hub, handle, queue, sink, stream, config).await;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    to_id: String,
    content: String,
}

/// POST /api/chat/messages
async fn send_message_handler(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<Envelope>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let envelope = state
        .delivery
        .send_message(user, UserId::from_raw(req.to_id), req.content)
        .await?;
    Ok(Json(envelope))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

/// GET /api/chat/messages/{user_id}
async fn history_handler(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(other): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Envelope>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(state.config.history_limit)
        .clamp(1, MAX_HISTORY_LIMIT);
    let messages = state
        .delivery
        .history(user, UserId::from_raw(other), limit)
        .await?;
    Ok(Json(messages))
}
