//! WebSocket endpoint for tunnel connections.
//!
//! Flow:
//! 1. The local agent connects to `/api/tunnel/<sandbox_id>?token=<tunnel_token>`
//! 2. On upgrade the sandbox transitions `offline → running` (or
//!    `creating → running` on first attach) and the tunnel registers,
//!    evicting any prior connection for the sandbox
//! 3. Binary frames only: the server pushes `request` frames, the agent
//!    answers with `stream` frames (see dd-protocol)
//! 4. The server pings periodically; silence beyond the read timeout tears
//!    the tunnel down and the sandbox goes offline

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dd_domain::token::token_eq;
use dd_store::Store;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::AppState;
use crate::tunnel::registry::Tunnel;

/// Heartbeat writes are coalesced to at most one per this interval.
const HEARTBEAT_WRITE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    pub token: Option<String>,
}

/// GET /api/tunnel/:sandbox_id — upgrade to WebSocket.
///
/// Authenticated solely by the sandbox's tunnel token; invalid or missing
/// tokens are rejected before the upgrade.
pub async fn tunnel_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(sandbox_id): Path<Uuid>,
    Query(query): Query<TunnelQuery>,
) -> Response {
    let provided = query.token.as_deref().unwrap_or("");

    let sandbox = match state.store.sandbox(sandbox_id).await {
        Ok(Some(sb)) => sb,
        Ok(None) => return unauthorized(),
        Err(e) => {
            tracing::error!(error = %e, "tunnel auth lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let valid = sandbox
        .tunnel_token
        .as_deref()
        .is_some_and(|expected| token_eq(expected, provided));
    if !valid {
        return unauthorized();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, sandbox_id))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "invalid or missing tunnel token").into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, sandbox_id: Uuid) {
    // The attach is rejected while the sandbox is deleting.
    if let Err(e) = state.lifecycle.observe_tunnel_attach(sandbox_id).await {
        tracing::warn!(sandbox_id = %sandbox_id, error = %e, "tunnel attach rejected");
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);
    let tunnel = Arc::new(Tunnel::new(sandbox_id, outbound_tx));
    state.tunnels.register(tunnel.clone());
    let shutdown = tunnel.shutdown_signal();

    tracing::info!(sandbox_id = %sandbox_id, "tunnel connected");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: forwards encoded frames and emits periodic pings.
    let ping_period =
        Duration::from_secs(state.config.limits.tunnel_ping_interval_secs.max(1));
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = outbound_rx.recv() => match msg {
                    Some(bytes) => {
                        if ws_sink.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if ws_sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sink.send(Message::Close(None)).await;
    });

    // Reader loop. Any traffic counts as liveness; silence beyond the read
    // timeout tears the tunnel down.
    let read_timeout =
        Duration::from_secs(state.config.limits.tunnel_read_timeout_secs.max(1) as u64);
    let mut last_heartbeat_write = tokio::time::Instant::now();

    loop {
        tokio::select! {
            // Evicted by a replacement connection or a delete.
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(read_timeout, ws_stream.next()) => {
                let message = match next {
                    Err(_) => {
                        tracing::warn!(sandbox_id = %sandbox_id, "tunnel read timeout");
                        break;
                    }
                    Ok(None) | Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(message))) => message,
                };
                tunnel.touch();
                if last_heartbeat_write.elapsed() >= HEARTBEAT_WRITE_INTERVAL {
                    last_heartbeat_write = tokio::time::Instant::now();
                    if let Err(e) = state.store.touch_heartbeat(sandbox_id).await {
                        tracing::warn!(sandbox_id = %sandbox_id, error = %e, "heartbeat write failed");
                    }
                }
                match message {
                    Message::Binary(bytes) => match dd_protocol::decode(&bytes) {
                        Ok(frame) => tunnel.deliver(&frame.header, frame.payload).await,
                        Err(e) => {
                            tracing::debug!(sandbox_id = %sandbox_id, error = %e,
                                "ignoring undecodable frame");
                        }
                    },
                    // Axum answers pings itself; both directions count as liveness.
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                    Message::Text(_) => {
                        tracing::debug!(sandbox_id = %sandbox_id, "ignoring text frame");
                    }
                }
            }
        }
    }

    writer.abort();
    // Only the still-registered connection transitions the sandbox; a
    // socket evicted by its replacement must not mark the new one offline.
    let was_current = state.tunnels.remove_exact(&tunnel);
    if was_current {
        state.lifecycle.observe_tunnel_detach(sandbox_id).await;
    }
    tracing::info!(sandbox_id = %sandbox_id, was_current, "tunnel disconnected");
}
