//! Connection handlers for the Vortex server.
//!
//! The WebSocket handler owns only framing: it feeds inbound frames to the
//! session and flushes the session's outbound queue. Protocol semantics
//! live in the session. The API handler verifies the request signature and
//! hands each command to the coordinator's dispatch table.

use crate::authorize::{HttpAuthorizer, PublishWebhook};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::node::{NodeCoordinator, NodeSettings};
use crate::session::{self, Session};
use crate::structure::ConfigStructure;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vortex_core::{auth, AdminHub, Engine, MemoryEngine, SubscriptionRegistry};
use vortex_protocol::{decode_batch, push, Response};

/// Shared server state.
pub struct AppState {
    /// The node coordinator.
    pub coordinator: Arc<NodeCoordinator>,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let structure = Arc::new(ConfigStructure::new(&config));
    let authorizer = Arc::new(HttpAuthorizer::new(&config.web));
    let registry = Arc::new(SubscriptionRegistry::new());
    let admin = Arc::new(AdminHub::new());
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let engine: Arc<dyn Engine> = match config.engine.name.as_str() {
        "memory" => Arc::new(MemoryEngine::new(registry, admin, control_tx)),
        other => anyhow::bail!("Unknown engine: {other}"),
    };
    engine.initialize().await?;
    info!(engine = engine.name(), "Engine initialized");

    let mut coordinator = NodeCoordinator::new(
        NodeSettings::from(&config),
        engine,
        structure,
        authorizer,
    );
    if let Some(endpoint) = &config.web.publish_hook_endpoint {
        coordinator = coordinator.with_notifier(Box::new(PublishWebhook::new(
            endpoint.clone(),
            std::time::Duration::from_millis(config.web.timeout_ms),
        )));
    }
    let coordinator = Arc::new(coordinator);
    coordinator.start(control_rx);

    let state = Arc::new(AppState {
        coordinator,
        config: config.clone(),
    });

    // Build router
    let app = Router::new()
        .route("/connection/websocket", get(ws_handler))
        .route("/api/:project", post(api_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Vortex server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/connection/websocket", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler with basic node stats.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (clients, users) = state.coordinator.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "node": state.coordinator.uid(),
        "nodes": state.coordinator.node_list().len(),
        "clients": clients,
        "users": users,
        "channels": state.coordinator.engine().channel_count(),
    }))
}

/// Signed server API request.
#[derive(Debug, Deserialize)]
struct ApiForm {
    /// HMAC signature over the project id and the raw data string.
    sign: String,
    /// One command object or an array of them, JSON-encoded.
    data: String,
}

/// Server API handler: `POST /api/{project}` with form-encoded
/// `sign`/`data`.
async fn api_handler(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Form(form): Form<ApiForm>,
) -> impl IntoResponse {
    let secret = match state.coordinator.structure().get_project_by_id(&project) {
        Ok(Some(project)) => project.secret,
        Ok(None) => return (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))),
        Err(e) => {
            warn!(error = %e, "Structure lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_server_error"})),
            );
        }
    };

    if !auth::check_api_sign(&secret, &project, &form.data, &form.sign) {
        metrics::record_error("api_sign");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        );
    }

    let requests = match decode_batch(&form.data, state.coordinator.settings().max_batch) {
        Ok(requests) => requests,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string()})),
            )
        }
    };

    let mut responses: Vec<Response> = Vec::with_capacity(requests.len());
    for request in &requests {
        responses.push(state.coordinator.api_dispatch(&project, request).await);
    }
    match serde_json::to_value(&responses) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => {
            warn!(error = %e, "API response serialization failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_server_error"})),
            )
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Outbound queue: the session and every broadcast path feed this.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = Arc::new(Session::new(Arc::clone(&state.coordinator), tx));
    let max_batch = state.coordinator.settings().max_batch;

    debug!(connection = %session.id, "WebSocket connected");

    loop {
        tokio::select! {
            biased;

            // Pushes queued for this connection (broadcasts, notices)
            Some(payload) = rx.recv() => {
                metrics::record_message(payload.len(), "outbound");
                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_frame(&session, &text, max_batch, &mut sender).await {
                            break;
                        }
                        metrics::set_active_channels(
                            state.coordinator.engine().channel_count(),
                        );
                    }
                    Some(Ok(Message::Binary(data))) => {
                        // Treat binary frames as text
                        let Ok(text) = String::from_utf8(data) else {
                            warn!(connection = %session.id, "Non-UTF-8 binary frame");
                            break;
                        };
                        if handle_frame(&session, &text, max_batch, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %session.id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %session.id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %session.id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Full session cleanup: presence, subscriptions, leave notices,
    // coordinator deregistration.
    session.close().await;

    debug!(connection = %session.id, "WebSocket disconnected");
}

/// Process one inbound frame. Returns `true` when the transport must
/// close: the partial response batch is flushed first, then a best-effort
/// disconnect notice.
async fn handle_frame(
    session: &Arc<Session>,
    text: &str,
    max_batch: usize,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    let start = Instant::now();
    metrics::record_message(text.len(), "inbound");

    let (responses, close) = session::process_frame(session, text, max_batch).await;

    if !responses.is_empty() {
        let payload = match serde_json::to_string(&responses) {
            Ok(payload) => payload,
            Err(e) => {
                error!(connection = %session.id, error = %e, "Response serialization failed");
                return true;
            }
        };
        metrics::record_message(payload.len(), "outbound");
        if sender.send(Message::Text(payload)).await.is_err() {
            return true;
        }
    }

    metrics::record_latency(start.elapsed().as_secs_f64());

    if close {
        metrics::record_error("protocol");
        let notice = push("disconnect", json!({ "reason": "protocol violation" })).to_string();
        let _ = sender.send(Message::Text(notice)).await;
        return true;
    }
    false
}
