//! HTTP and WebSocket surface.

use crate::backend::Backend;
use crate::config::Settings;
use crate::envelope::{EnvelopeFormat, WireFrame};
use crate::error::HubError;
use crate::producer::Producer;
use crate::registry::Registry;
use crate::subscriber::{FrameSink, SinkClosed, Subscriber};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Header identifying the serving host on every response, including the
/// WebSocket accept.
pub const SERVER_HOST_HEADER: &str = "x-server-host";

/// Shared per-process state: one configuration, one backend handle.
#[derive(Clone)]
pub struct HubState {
    pub registry: Registry,
    pub producer: Producer,
    pub backend: Arc<dyn Backend>,
    pub settings: Arc<Settings>,
    pub server_host: String,
}

impl HubState {
    pub fn new(backend: Arc<dyn Backend>, settings: Arc<Settings>) -> Self {
        let server_host = gethostname::gethostname().to_string_lossy().into_owned();
        Self {
            registry: Registry::new(backend.clone()),
            producer: Producer::new(backend.clone(), settings.clone()),
            backend,
            settings,
            server_host,
        }
    }
}

/// Build the hub router.
///
/// The default body limit is disabled so the configured payload cap is the
/// only limit in play; it is enforced before any side effect.
pub fn router(state: HubState) -> Router {
    let server_host = state.server_host.clone();
    Router::new()
        .route("/upload", post(create_dataset))
        .route(
            "/upload/:node_id",
            post(append_frame).delete(delete_dataset),
        )
        .route("/close/:node_id", post(close_dataset))
        .route("/stream/live", get(list_live))
        .route("/stream/single/:node_id", get(stream_single))
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(move |request: Request, next: Next| {
            let server_host = server_host.clone();
            async move {
                let mut response = next.run(request).await;
                if let Ok(value) = HeaderValue::from_str(&server_host) {
                    response.headers_mut().insert(SERVER_HOST_HEADER, value);
                }
                response
            }
        }))
        .with_state(state)
}

/// Serve the hub until `shutdown` resolves.
pub async fn serve(
    state: HubState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let bind = state.settings.bind;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "hub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

async fn create_dataset(State(state): State<HubState>) -> Result<Json<Value>, HubError> {
    let node_id = state.registry.create().await?;
    info!(node_id, "dataset created");
    Ok(Json(json!({ "node_id": node_id })))
}

async fn delete_dataset(
    State(state): State<HubState>,
    Path(node_id): Path<String>,
) -> Result<StatusCode, HubError> {
    state.registry.delete(&node_id).await?;
    info!(%node_id, "dataset ended");
    Ok(StatusCode::NO_CONTENT)
}

async fn append_frame(
    State(state): State<HubState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, HubError> {
    state.producer.append(&node_id, body, &headers).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct CloseRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn close_dataset(
    State(state): State<HubState>,
    Path(node_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, HubError> {
    // Reject malformed JSON before any side effect.
    let request: CloseRequest =
        serde_json::from_slice(&body).map_err(|err| HubError::InvalidJson(err.to_string()))?;

    state
        .producer
        .close(&node_id, request.reason.clone())
        .await?;
    Ok(Json(json!({
        "status": format!("Connection for node {node_id} is now closed."),
        "reason": request.reason,
    })))
}

async fn list_live(State(state): State<HubState>) -> Result<Json<Vec<String>>, HubError> {
    Ok(Json(state.registry.list_live().await?))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    #[serde(default)]
    envelope_format: Option<String>,
    #[serde(default)]
    seq_num: Option<u64>,
}

async fn stream_single(
    State(state): State<HubState>,
    Path(node_id): Path<String>,
    Query(params): Query<StreamParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let format = params
        .envelope_format
        .as_deref()
        .map(EnvelopeFormat::from_selector)
        .unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(state, node_id, format, params.seq_num, socket))
}

async fn handle_socket(
    state: HubState,
    node_id: String,
    format: EnvelopeFormat,
    start_seq: Option<u64>,
    socket: WebSocket,
) {
    info!(%node_id, ?format, ?start_seq, "subscriber connected");
    let subscriber = Subscriber::new(
        state.backend.clone(),
        state.settings.clone(),
        node_id.clone(),
        format,
        state.server_host.clone(),
    );
    let mut sink = WebSocketSink { socket };
    let end = subscriber.run(&mut sink, start_seq).await;
    debug!(%node_id, ?end, "subscriber finished");
}

struct WebSocketSink {
    socket: WebSocket,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), SinkClosed> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(bytes) => Message::Binary(bytes),
        };
        self.socket.send(message).await.map_err(|_| SinkClosed)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.socket.send(Message::Close(Some(frame))).await;
    }
}
