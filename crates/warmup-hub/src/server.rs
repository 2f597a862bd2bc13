use crate::{
    error::HubError,
    hub::{BroadcastHub, Connection, Outbound},
};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, DefaultBodyLimit, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{borrow::Cow, future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};
use warmup_core::{Command, CommandAck, CommandKind, ServerEnvelope, DEFAULT_MAX_FRAME_BYTES};

pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/api/warmup", post(warmup_handler))
        .route("/api/status", get(status_handler))
        .route("/api/ping", get(ping_handler))
        .layer(DefaultBodyLimit::max(DEFAULT_MAX_FRAME_BYTES))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<(), HubError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.max_message_size(DEFAULT_MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, socket, addr))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.queue_capacity);
    let conn_id = state.hub.next_conn_id();
    let write_timeout = state.write_timeout;
    let writer_conn = conn_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let msg = match item {
                Outbound::Envelope(envelope) => match envelope.encode() {
                    Ok(text) => Message::Text(text),
                    Err(err) => {
                        warn!(event = "encode_error", conn_id = %writer_conn, error = %err);
                        continue;
                    }
                },
                Outbound::Ping => Message::Ping(Vec::new()),
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: Cow::Owned(reason),
                    };
                    let _ = tokio::time::timeout(
                        write_timeout,
                        ws_sender.send(Message::Close(Some(frame))),
                    )
                    .await;
                    return;
                }
            };
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(event = "write_error", conn_id = %writer_conn, error = %err);
                    return;
                }
                Err(_) => {
                    warn!(event = "write_timeout", conn_id = %writer_conn);
                    return;
                }
            }
        }
    });

    let connection = Arc::new(Connection::new(conn_id.clone(), Some(remote), tx.clone()));
    if !state.hub.on_connect(connection.clone()).await {
        write_task.abort();
        return;
    }
    state.hub.clone().start_ping(connection.clone());

    loop {
        let msg = tokio::select! {
            next = ws_receiver.next() => match next {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break;
                }
                None => break,
            },
            _ = tx.closed() => {
                debug!(event = "writer_closed", conn_id = %conn_id);
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(event = "message_invalid", conn_id = %conn_id, error = "non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                connection.touch().await;
                continue;
            }
        };
        connection.touch().await;
        state.hub.on_message(&connection, &text).await;
    }

    state.hub.on_disconnect(&conn_id, "disconnect").await;
    drop(connection);
    drop(tx);
    if tokio::time::timeout(write_timeout, &mut write_task)
        .await
        .is_err()
    {
        write_task.abort();
    }
}

async fn warmup_handler(State(state): State<Arc<AppState>>, body: String) -> Response {
    let command = match Command::parse(&body) {
        Ok(value) => value,
        Err(rejected) => {
            warn!(event = "http_command_rejected", reason = rejected.reason);
            return ack_response(rejected.into_ack());
        }
    };
    if command.kind != CommandKind::Warmup {
        return ack_response(CommandAck::rejected(command.client_id, "unsupported_command"));
    }
    let reply = state.hub.execute(command).await;
    ack_response(reply.ack)
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<ServerEnvelope> {
    Json(ServerEnvelope::snapshot(state.hub.snapshot().await))
}

#[derive(Debug, Deserialize)]
struct PingQuery {
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

async fn ping_handler(Query(query): Query<PingQuery>) -> Json<ServerEnvelope> {
    Json(ServerEnvelope::pong(query.client_id))
}

fn ack_response(ack: CommandAck) -> Response {
    let status = if ack.accepted {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(ServerEnvelope::ack(ack))).into_response()
}
