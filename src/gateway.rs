//! Stateless HTTP/WebSocket front door.
//!
//! Routes:
//! - `GET /api/health`            → `200 ok`
//! - `GET /ws/:notebook_id`       → WebSocket upgrade, brokered to the
//!   notebook's coordinator
//! - `GET /:notebook_id/snapshot` → encoded document state
//! - anything else               → JSON self-description (also the probe
//!   clients use to detect a kernel URL pointed here by mistake)
//!
//! When an auth token is configured, `/ws` and `/snapshot` require a
//! matching `token` query parameter and fail with 401 before any
//! coordinator work happens. CORS headers go on HTTP responses only; the
//! upgrade path must stay free of them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::{CoordinatorHandle, Registry, SocketId};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Shared secret; `None` (or empty) leaves the endpoints open.
    pub auth_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            auth_token: None,
        }
    }
}

/// Shared state for all handlers.
#[derive(Clone)]
pub struct GatewayState {
    registry: Arc<Registry>,
    auth_token: Option<String>,
}

impl GatewayState {
    pub fn new(registry: Arc<Registry>, auth_token: Option<String>) -> Self {
        // An empty configured token means "no auth", not "empty password".
        let auth_token = auth_token.filter(|t| !t.is_empty());
        Self {
            registry,
            auth_token,
        }
    }

    fn authorized(&self, params: &HashMap<String, String>) -> bool {
        match &self.auth_token {
            None => true,
            Some(expected) => params.get("token").map(String::as_str) == Some(expected),
        }
    }
}

/// Build the gateway router.
pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // HTTP routes carry CORS; the websocket route must not, since grafted
    // Access-Control headers on a 101 break some clients.
    let http = Router::new()
        .route("/api/health", get(health).options(preflight))
        .route("/:notebook_id/snapshot", get(snapshot).options(preflight))
        .fallback(describe)
        .layer(cors);

    let ws = Router::new().route("/ws/:notebook_id", get(ws_upgrade));

    Router::new().merge(ws).merge(http).with_state(state)
}

/// Bind and serve until the task is dropped. Returns the bound address,
/// letting tests bind port 0.
pub async fn serve(
    config: GatewayConfig,
    registry: Arc<Registry>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
    let state = GatewayState::new(registry, config.auth_token);
    let app = router(state);
    let listener = TcpListener::bind(&config.bind_addr).await?;
    let addr = listener.local_addr()?;
    log::info!("collab gateway listening on {addr}");
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("gateway server error: {e}");
        }
    });
    Ok((addr, task))
}

async fn health() -> &'static str {
    "ok"
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// JSON self-description for unmatched paths. Clients probe this shape to
/// detect a kernel URL that actually points at this gateway.
async fn describe(method: axum::http::Method) -> Response {
    if method == axum::http::Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    Json(json!({
        "ok": true,
        "message": "Notebook collaboration gateway. Connect clients over WebSocket.",
        "endpoints": {
            "health": "/api/health",
            "websocket": "/ws/:notebookId",
        },
    }))
    .into_response()
}

async fn snapshot(
    Path(notebook_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<GatewayState>,
) -> Response {
    if !state.authorized(&params) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let handle = match state.registry.coordinator(&notebook_id).await {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("snapshot: activating {notebook_id} failed: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "activation failed").into_response();
        }
    };
    match handle.snapshot().await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            log::error!("snapshot: reading {notebook_id} failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "snapshot failed").into_response()
        }
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(notebook_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<GatewayState>,
) -> Response {
    // Reject before the upgrade and before any coordinator activation.
    if !state.authorized(&params) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    ws.on_upgrade(move |socket| async move {
        let handle = match state.registry.coordinator(&notebook_id).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("ws: activating {notebook_id} failed: {e}");
                return;
            }
        };
        drive_socket(socket, handle, &notebook_id).await;
    })
}

/// Pump frames between one WebSocket and the coordinator until either side
/// closes.
async fn drive_socket(socket: WebSocket, handle: CoordinatorHandle, notebook_id: &str) {
    let (outbound_tx, mut outbound_rx) = unbounded_channel::<Vec<u8>>();
    let socket_id: SocketId = match handle.attach(outbound_tx).await {
        Ok(id) => id,
        Err(e) => {
            log::warn!("ws: attach to {notebook_id} failed: {e}");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sender.send(WsMessage::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(WsMessage::Binary(data)) => {
                let data: Vec<u8> = data.into();
                if handle.frame(socket_id, data).await.is_err() {
                    break;
                }
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            // Ping/pong are handled by axum; text frames are not part of
            // the protocol.
            Ok(_) => {}
        }
    }

    let _ = handle.detach(socket_id).await;
    writer.abort();
    log::debug!("ws: socket {socket_id} on {notebook_id} closed");
}
