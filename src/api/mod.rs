//! HTTP and WebSocket server
//!
//! Binds the sync bridge to axum WebSocket connections and exposes a small
//! REST surface over the store.
//! Default port: 8125

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::bridge::{Frame, SyncBridge};
use crate::error::StoreError;
use crate::state::{Store, Update};

/// Default API port
pub const DEFAULT_API_PORT: u16 = 8125;

/// Default WebSocket route
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Shared state for API handlers
pub struct ApiState {
    pub store: Store,
    pub bridge: SyncBridge,
}

impl ApiState {
    pub fn new(bridge: SyncBridge) -> Self {
        Self {
            store: bridge.store().clone(),
            bridge,
        }
    }
}

/// Request body for setting one field
#[derive(Debug, Deserialize)]
pub struct SetValueRequest {
    pub value: Value,
}

/// API error response
#[derive(Debug, Serialize)]
struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match e {
            StoreError::UnknownKey { .. } => StatusCode::NOT_FOUND,
            StoreError::KindMismatch { .. } => StatusCode::CONFLICT,
            StoreError::NumberOverflow { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::ListenerPanicked { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            error: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Build the API router
pub fn build_router(state: Arc<ApiState>, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(state_ws))
        .route("/api/state", get(get_state))
        .route("/api/state/:key", get(get_field).put(set_field))
        .route("/api/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /api/state - Full snapshot
async fn get_state(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(Value::Object(state.store.state()))
}

/// GET /api/state/:key - One field
async fn get_field(
    Path(key): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .get(&key)
        .map(Json)
        .ok_or_else(|| StoreError::UnknownKey { key }.into())
}

/// PUT /api/state/:key - Replace one field, replicated like any mutation
async fn set_field(
    Path(key): Path<String>,
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SetValueRequest>,
) -> Result<Json<Value>, ApiError> {
    state.store.mutate(&key, Update::Replace(req.value))?;
    info!("State field set over HTTP: {}", key);

    Ok(Json(serde_json::json!({
        "ok": true,
        "key": key,
    })))
}

/// GET {ws_path} - Bidirectional state sync
async fn state_ws(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Pump one WebSocket: bridge queue → socket, socket frames → bridge
async fn handle_websocket(mut socket: WebSocket, state: Arc<ApiState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client_id = state.bridge.on_open(tx);

    loop {
        tokio::select! {
            // Forward queued envelopes to the socket
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            debug!(client = %client_id, "WebSocket send failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        state.bridge.on_message(client_id, Frame::Text(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        state.bridge.on_message(client_id, Frame::Binary(data));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client = %client_id, "WebSocket client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %client_id, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    state.bridge.on_close(client_id);
}

/// GET /api/health - Health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read bound address")?;
    info!("State sync server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

/// Bind `host:port` and serve
pub async fn start_server(
    state: Arc<ApiState>,
    host: &str,
    port: u16,
    ws_path: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = build_router(state, ws_path);

    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind API server on {}:{}", host, port))?;

    serve(listener, router, shutdown).await
}
