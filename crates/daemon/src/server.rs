//! HTTP and WebSocket surface.
//!
//! Routes:
//! - `GET /ws`: one WebSocket per client channel
//! - `POST /session/:id/resized`: resize a session
//! - `GET /health`: liveness and session count

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{ResizeRequest, ResizeResponse};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::channel::{ChannelError, ClientConnection, FrameSink};
use crate::router::ProtocolDispatcher;

/// Application state shared across routes.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ProtocolDispatcher>,
}

/// Create router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/session/:id/resized", post(resize_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Write half of a WebSocket as a frame sink.
struct WsFrameSink(SplitSink<WebSocket, WsMessage>);

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.0
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}

/// GET /ws - WebSocket endpoint
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle one client channel.
///
/// Text frames are dispatched strictly in arrival order. Sessions created on
/// the channel outlive it until they are evicted.
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();
    let connection = ClientConnection::new(Box::new(WsFrameSink(ws_sink)));
    tracing::info!(connection_id = %connection.id(), "Client connected");

    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                state.dispatcher.handle_text(&connection, &text).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection_id = %connection.id(), error = %e, "WebSocket receive failed");
                break;
            }
        }
    }

    connection.mark_closed();
    let stats = connection.stats();
    tracing::info!(
        connection_id = %connection.id(),
        frames_sent = stats.frames_sent,
        frames_dropped = stats.frames_dropped,
        "Client disconnected"
    );
}

/// POST /session/:id/resized - Resize a session
async fn resize_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Json<ResizeResponse> {
    Json(state.dispatcher.resize(&id, req).await)
}

/// GET /health - Liveness probe
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.dispatcher.registry().len(),
    }))
}
