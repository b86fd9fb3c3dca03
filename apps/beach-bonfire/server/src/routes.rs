use std::{borrow::Cow, future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use beach_bonfire_core::{close, Role, RoomId, Uid, RELAY_UID};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn, Instrument};

use crate::{
    registry::{Outbound, TransportHandle},
    relay::{Connection, Disposition, SignalingRelay},
    telemetry::connection_span,
};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct AppState {
    relay: SignalingRelay,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(relay: SignalingRelay, metrics: Option<PrometheusHandle>) -> Self {
        Self { relay, metrics }
    }

    pub fn relay(&self) -> &SignalingRelay {
        &self.relay
    }
}

/// Query string presented when opening `/ws`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinQuery {
    room_id: String,
    uid: Uid,
    role: Option<String>,
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("roomId must not be empty")]
    MissingRoom,
    #[error("uid {0} is reserved for the relay")]
    ReservedUid(Uid),
    #[error(transparent)]
    InvalidRole(#[from] beach_bonfire_core::ProtocolError),
}

impl HandshakeError {
    fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::MissingRoom => "missing_room",
            HandshakeError::ReservedUid(_) => "reserved_uid",
            HandshakeError::InvalidRole(_) => "invalid_role",
        }
    }
}

struct JoinParams {
    room_id: RoomId,
    uid: Uid,
    role: Role,
}

impl TryFrom<JoinQuery> for JoinParams {
    type Error = HandshakeError;

    fn try_from(query: JoinQuery) -> Result<Self, Self::Error> {
        let room_id = query.room_id.trim();
        if room_id.is_empty() {
            return Err(HandshakeError::MissingRoom);
        }
        if query.uid == RELAY_UID {
            return Err(HandshakeError::ReservedUid(query.uid));
        }
        let role = match query.role.as_deref() {
            Some(value) => value.parse()?,
            None => Role::Listener,
        };
        Ok(Self {
            room_id: RoomId::new(room_id),
            uid: query.uid,
            role,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.relay.registry().stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JoinQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match JoinParams::try_from(query) {
        Ok(params) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, params))
            .into_response(),
        Err(err) => {
            counter!("bonfire_handshakes_rejected_total", 1, "reason" => err.metric_label());
            warn!(error = %err, "rejecting signaling handshake");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: JoinParams) {
    let (handle, mut outbound) = TransportHandle::channel();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let connection = match state
        .relay
        .open(params.room_id, params.uid, params.role, handle)
    {
        Ok(connection) => connection,
        Err(err) => {
            warn!(uid = params.uid, error = %err, "registration refused");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close::TRY_AGAIN_LATER,
                    reason: Cow::Borrowed(close::REASON_ROOM_FULL),
                })))
                .await;
            return;
        }
    };

    let span = connection_span(
        &connection.room_id,
        connection.uid,
        connection.handle.connection_id(),
    );
    let writer_span = span.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let (message, last) = match frame {
                Outbound::Text(text) => (Message::Text(text.to_string()), false),
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Borrowed(reason),
                    })),
                    true,
                ),
            };
            if ws_tx.send(message).await.is_err() || last {
                break;
            }
        }
        debug!("writer task finished");
    }.instrument(writer_span));

    read_loop(&state.relay, &connection, &mut ws_rx)
        .instrument(span)
        .await;

    state.relay.close(&connection);
    let writer_abort = writer.abort_handle();
    drop(connection);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        writer_abort.abort();
    }
}

async fn read_loop(
    relay: &SignalingRelay,
    connection: &Connection,
    ws_rx: &mut futures_util::stream::SplitStream<WebSocket>,
) {
    while let Some(message) = ws_rx.next().await {
        let disposition = match message {
            Ok(Message::Text(text)) => relay.handle_text(connection, &text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => relay.handle_text(connection, text),
                Err(_) => {
                    debug!(uid = connection.uid, "ignoring non-utf8 binary frame");
                    Disposition::Continue
                }
            },
            Ok(Message::Close(frame)) => {
                info!(
                    room_id = %connection.room_id,
                    uid = connection.uid,
                    code = ?frame.as_ref().map(|f| f.code),
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                Disposition::Close
            }
            Ok(_) => Disposition::Continue,
            Err(err) => {
                warn!(
                    room_id = %connection.room_id,
                    uid = connection.uid,
                    error = %err,
                    "error receiving message"
                );
                Disposition::Close
            }
        };
        if disposition == Disposition::Close {
            break;
        }
    }
}
