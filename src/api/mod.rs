//! HTTP surface.
//!
//! Maps a small set of HTTP verbs to pool and session operations, and
//! performs the WebSocket upgrade that drives the per-client read loop.
//! All request and response bodies are JSON; server-to-client WebSocket
//! frames are binary and carry raw PTY output with no framing added.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{self, BasicAuth};
use crate::session::pool::SessionPool;
use crate::session::session::{
    ClientConnection, Session, TAKEOVER_CLOSE_CODE, TAKEOVER_CLOSE_REASON,
};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Shared state behind every handler.
pub struct AppState {
    pub pool: Arc<SessionPool>,
    pub auth: Option<BasicAuth>,
}

/// Builds the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/pty", post(create_session))
        .route(
            "/pty/:id",
            get(session_info).put(update_session).delete(delete_session),
        )
        .route("/pty/:id/takeover", post(takeover_session))
        .route("/pty/:id/connect", get(connect_session))
        .with_state(Arc::clone(&state));

    if state.auth.is_some() {
        router = router.layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_basic_auth,
        ));
    }

    router.layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.pool.count(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateRequest {
    cols: u16,
    rows: u16,
    command: String,
    args: Vec<String>,
    workdir: String,
}

#[derive(Serialize)]
struct CreateResponse {
    id: String,
}

async fn create_session(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: CreateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid request body").into_response(),
    };

    let cols = if request.cols == 0 {
        DEFAULT_COLS
    } else {
        request.cols
    };
    let rows = if request.rows == 0 {
        DEFAULT_ROWS
    } else {
        request.rows
    };

    match state
        .pool
        .create(cols, rows, &request.command, &request.args, &request.workdir)
        .await
    {
        Ok(session) => Json(CreateResponse {
            id: session.id().to_string(),
        })
        .into_response(),
        Err(err) => {
            error!(error = %err, "Failed to create session");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to create session: {err}"),
            )
                .into_response()
        }
    }
}

#[derive(Serialize)]
struct SessionInfoResponse {
    id: String,
    occupied: bool,
    #[serde(rename = "clientInfo", skip_serializing_if = "String::is_empty")]
    client_info: String,
    cols: u16,
    rows: u16,
}

async fn session_info(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Some(session) = state.pool.get(&id) else {
        return session_not_found();
    };

    let (cols, rows) = session.size().await;
    Json(SessionInfoResponse {
        id: session.id().to_string(),
        occupied: session.is_occupied().await,
        client_info: session.connected_client_id().await,
        cols,
        rows,
    })
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateRequest {
    size: Option<SizeRequest>,
}

#[derive(Debug, Deserialize)]
struct SizeRequest {
    cols: u16,
    rows: u16,
}

async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let Some(session) = state.pool.get(&id) else {
        return session_not_found();
    };

    let request: UpdateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid request body").into_response(),
    };

    if let Some(size) = request.size {
        if let Err(err) = session.resize(size.cols, size.rows).await {
            error!(session_id = %id, error = %err, "Failed to resize");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to resize").into_response();
        }
    }

    StatusCode::OK.into_response()
}

async fn delete_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    state.pool.remove(&id).await;
    StatusCode::OK.into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TakeoverRequest {
    #[serde(rename = "clientId")]
    client_id: String,
}

#[derive(Serialize)]
struct TakeoverResponse {
    success: bool,
    #[serde(rename = "disconnectedCount")]
    disconnected_count: usize,
    #[serde(rename = "newClientId")]
    new_client_id: String,
}

async fn takeover_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let Some(session) = state.pool.get(&id) else {
        return session_not_found();
    };

    // An empty or malformed body is allowed; the client id is minted then.
    let request: TakeoverRequest = serde_json::from_slice(&body).unwrap_or_default();
    let new_client_id = if request.client_id.is_empty() {
        generate_client_id()
    } else {
        request.client_id
    };

    let disconnected = session
        .disconnect_all(TAKEOVER_CLOSE_CODE, TAKEOVER_CLOSE_REASON)
        .await;

    info!(
        session_id = %id,
        disconnected,
        new_client_id = %new_client_id,
        "Session takeover"
    );

    Json(TakeoverResponse {
        success: true,
        disconnected_count: disconnected,
        new_client_id,
    })
    .into_response()
}

async fn connect_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(session) = state.pool.get(&id) else {
        return session_not_found();
    };

    ws.on_upgrade(move |socket| run_client(session, socket))
}

/// Per-client loop: register the socket, pump its frames into the PTY,
/// deregister on the way out.
async fn run_client(session: Arc<Session>, socket: WebSocket) {
    let client_id = generate_client_id();
    let key = next_client_key();

    let (sink, mut stream) = socket.split();
    let conn: Arc<WsClient> = Arc::new(WsClient::new(sink));

    if session
        .add_client(key, client_id.clone(), conn.clone())
        .await
        .is_err()
    {
        conn.send_close(1000, "session closed").await;
        conn.shutdown().await;
        return;
    }

    info!(session_id = %session.id(), client_id = %client_id, "Client connected");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                if session.write(&data).await.is_err() {
                    break;
                }
            }
            Ok(Message::Text(text)) => {
                if session.write(text.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            // Pings are answered by axum; nothing to do here.
            Ok(_) => {}
            Err(_) => break,
        }
    }

    session.remove_client(key).await;
    conn.shutdown().await;

    info!(session_id = %session.id(), client_id = %client_id, "Client disconnected");
}

fn session_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Session not found").into_response()
}

/// Mints a 16-hex-character client id from 8 random bytes.
fn generate_client_id() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn next_client_key() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// [`ClientConnection`] over the sink half of an axum WebSocket.
struct WsClient {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsClient {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl ClientConnection for WsClient {
    async fn send_binary(&self, data: &[u8]) -> std::io::Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::BrokenPipe, err))
    }

    async fn send_close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        if let Err(err) = self
            .sink
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await
        {
            warn!(error = %err, "Failed to send close frame");
        }
    }

    async fn shutdown(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}
