//! Per-sandbox subdomain proxy.
//!
//! The ingress delivers requests whose `Host` is `<short_id>.<base_domain>`.
//! This layer authenticates the browser session, authorizes workspace
//! membership (404 on failure, never 403, so existence is not confirmed),
//! and streams the request to the sandbox: cloud sandboxes via their stored
//! endpoint, local sandboxes via the reverse tunnel. Responses are never
//! buffered, so SSE and WebSocket upgrades pass straight through.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use dd_domain::{SandboxKind, SandboxStatus};
use dd_store::{Sandbox, Store};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as TsMessage;
use uuid::Uuid;

use crate::api::auth::session_user;
use crate::proxy::headers::{
    cookie_value, sandbox_basic_auth, strip_credentials, strip_hop_by_hop,
};
use crate::proxy::pages;
use crate::state::AppState;
use crate::tunnel::registry::{StreamEvent, Tunnel};

/// Largest request body accepted over the tunnel path. HTTP bodies ride in
/// a single request frame, so this bounds frame size.
const MAX_TUNNEL_BODY: usize = 8 * 1024 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wraps the whole router: requests addressed to a sandbox subdomain are
/// handled here; everything else continues to the API routes.
pub async fn subdomain_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(short_id) = state.config.routing.short_id_from_host(host) else {
        return next.run(req).await;
    };
    handle(state, short_id, req).await
}

async fn handle(state: AppState, short_id: String, req: Request) -> Response {
    // 1. Browser session. A missing or expired cookie redirects to the
    //    parent-domain login so the re-issued cookie covers all subdomains.
    let cookie = cookie_value(req.headers(), &state.config.routing.session_cookie);
    let user = match cookie {
        Some(cookie) => session_user(&state, &cookie).await,
        None => None,
    };
    let Some(user) = user else {
        return Redirect::temporary(&state.config.routing.login_url()).into_response();
    };

    // 2. Sandbox lookup + membership. Both failures are a plain 404.
    let sandbox = match state.store.sandbox_by_short_id(&short_id).await {
        Ok(Some(sb)) => sb,
        Ok(None) => return not_found(),
        Err(e) => {
            tracing::error!(error = %e, "sandbox lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match state.store.member_role(sandbox.workspace_id, user.id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(e) => {
            tracing::error!(error = %e, "membership lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    // 3. Only running sandboxes serve traffic.
    match sandbox.status {
        SandboxStatus::Running => {}
        SandboxStatus::Paused => return pages::paused_page(&sandbox.name),
        other => return pages::unavailable_json(&format!("sandbox is {other}")),
    }

    // The browser hit is recorded before any backend effect is observable.
    tracing::info!(
        sandbox_id = %sandbox.id,
        short_id = %short_id,
        user_id = %user.id,
        method = %req.method(),
        path = %req.uri().path(),
        "proxying sandbox request"
    );
    if let Err(e) = state.store.touch_activity(sandbox.id).await {
        tracing::warn!(sandbox_id = %sandbox.id, error = %e, "activity touch failed");
    }

    match sandbox.kind {
        SandboxKind::Cloud => {
            let Some(endpoint) = sandbox.endpoint.clone() else {
                // Transition window: running row whose endpoint write lost a
                // race. Treat like mid-transition.
                return pages::unavailable_json("sandbox endpoint not ready");
            };
            if is_websocket_upgrade(req.headers()) {
                forward_websocket(state, sandbox, endpoint, req).await
            } else {
                forward_http(state, sandbox, endpoint, req).await
            }
        }
        SandboxKind::Local => {
            let Some(tunnel) = state.tunnels.get(sandbox.id) else {
                return pages::unavailable_json("sandbox tunnel is not connected");
            };
            forward_tunnel(state, sandbox, tunnel, req).await
        }
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({ "error": "not found" })),
    )
        .into_response()
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cloud: plain HTTP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn forward_http(
    state: AppState,
    sandbox: Sandbox,
    endpoint: String,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let path_q = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://{endpoint}{path_q}");

    let mut headers = strip_hop_by_hop(&parts.headers);
    strip_credentials(&mut headers);
    headers.insert(header::AUTHORIZATION, sandbox_basic_auth(&sandbox.sandbox_token));

    let outbound = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    match outbound {
        Ok(upstream) => {
            let status = upstream.status();
            let headers = strip_hop_by_hop(upstream.headers());
            let mut response = Response::builder()
                .status(status)
                .body(Body::from_stream(upstream.bytes_stream()))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            tracing::warn!(sandbox_id = %sandbox.id, error = %e, "sandbox forward failed");
            (
                StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({ "error": "sandbox unreachable" })),
            )
                .into_response()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cloud: WebSocket passthrough
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn forward_websocket(
    _state: AppState,
    sandbox: Sandbox,
    endpoint: String,
    req: Request,
) -> Response {
    let (mut parts, _body) = req.into_parts();
    let path_q = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let url = format!("ws://{endpoint}{path_q}");
    let auth = sandbox_basic_auth(&sandbox.sandbox_token);
    upgrade.on_upgrade(move |client| async move {
        let request = match tokio_tungstenite::tungstenite::http::Request::builder()
            .uri(&url)
            .header(header::AUTHORIZATION, auth)
            .body(())
        {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox.id, error = %e, "bad upstream ws request");
                return;
            }
        };
        match tokio_tungstenite::connect_async(request).await {
            Ok((upstream, _)) => bridge_websockets(client, upstream).await,
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox.id, error = %e, "sandbox ws dial failed");
            }
        }
    })
}

/// Copy frames in both directions until either side closes.
async fn bridge_websockets<S>(
    client: WebSocket,
    upstream: tokio_tungstenite::WebSocketStream<S>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_sink, mut client_stream) = client.split();
    let (mut upstream_sink, mut upstream_stream) = upstream.split();

    loop {
        tokio::select! {
            from_client = client_stream.next() => match from_client {
                Some(Ok(message)) => {
                    let closing = matches!(message, AxumMessage::Close(_));
                    if upstream_sink.send(axum_to_ts(message)).await.is_err() || closing {
                        break;
                    }
                }
                _ => break,
            },
            from_upstream = upstream_stream.next() => match from_upstream {
                Some(Ok(message)) => {
                    let closing = matches!(message, TsMessage::Close(_));
                    match ts_to_axum(message) {
                        Some(message) => {
                            if client_sink.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None if closing => break,
                        None => {}
                    }
                }
                _ => break,
            },
        }
    }
    let _ = client_sink.send(AxumMessage::Close(None)).await;
    let _ = upstream_sink.send(TsMessage::Close(None)).await;
}

fn axum_to_ts(message: AxumMessage) -> TsMessage {
    match message {
        AxumMessage::Text(text) => TsMessage::Text(text),
        AxumMessage::Binary(bytes) => TsMessage::Binary(bytes),
        AxumMessage::Ping(bytes) => TsMessage::Ping(bytes),
        AxumMessage::Pong(bytes) => TsMessage::Pong(bytes),
        AxumMessage::Close(frame) => TsMessage::Close(frame.map(|f| {
            tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: f.code.into(),
                reason: f.reason,
            }
        })),
    }
}

fn ts_to_axum(message: TsMessage) -> Option<AxumMessage> {
    match message {
        TsMessage::Text(text) => Some(AxumMessage::Text(text)),
        TsMessage::Binary(bytes) => Some(AxumMessage::Binary(bytes)),
        TsMessage::Ping(bytes) => Some(AxumMessage::Ping(bytes)),
        TsMessage::Pong(bytes) => Some(AxumMessage::Pong(bytes)),
        TsMessage::Close(frame) => Some(AxumMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        }))),
        // Raw frames never surface from a completed handshake.
        TsMessage::Frame(_) => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local: tunnel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn forward_tunnel(
    state: AppState,
    sandbox: Sandbox,
    tunnel: Arc<Tunnel>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let path_q = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let body = match axum::body::to_bytes(body, MAX_TUNNEL_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                axum::Json(serde_json::json!({ "error": "request body too large for tunnel" })),
            )
                .into_response()
        }
    };

    let mut headers = strip_hop_by_hop(&parts.headers);
    strip_credentials(&mut headers);
    headers.insert(header::AUTHORIZATION, sandbox_basic_auth(&sandbox.sandbox_token));
    let header_map = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let request_id = Uuid::new_v4().to_string();
    let frame = dd_protocol::Frame::request(
        request_id.clone(),
        parts.method.as_str(),
        path_q,
        header_map,
        body.to_vec(),
    );
    let encoded = match dd_protocol::encode(&frame) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::warn!(sandbox_id = %sandbox.id, error = %e, "request frame encode failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let mut rx = match tunnel.open_request(&request_id, encoded).await {
        Ok(rx) => rx,
        Err(_) => return pages::unavailable_json("sandbox tunnel is not connected"),
    };

    // The first stream frame carries status and headers.
    let idle = std::time::Duration::from_secs(state.config.upstream.idle_read_timeout_secs);
    let first = match tokio::time::timeout(idle, rx.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            return (
                StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({ "error": "tunnel closed before responding" })),
            )
                .into_response()
        }
        Err(_) => {
            tunnel.deregister(&request_id);
            return (
                StatusCode::GATEWAY_TIMEOUT,
                axum::Json(serde_json::json!({ "error": "sandbox did not respond in time" })),
            )
                .into_response()
        }
    };

    let status = StatusCode::from_u16(first.status.unwrap_or(502))
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    if let Some(pairs) = &first.headers {
        for (name, value) in pairs {
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response_headers.append(name, value);
            }
        }
    }
    let response_headers = strip_hop_by_hop(&response_headers);

    let body = if first.done {
        Body::from(first.chunk)
    } else {
        Body::from_stream(TunnelResponseBody::new(
            tunnel,
            request_id,
            rx,
            first.chunk,
        ))
    };

    let mut response = Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    *response.headers_mut() = response_headers;
    response
}

/// Streams tunnel chunks to the browser in socket arrival order. Dropping
/// it (browser disconnect) deregisters the waiter; no abort frame is sent
/// to the agent.
struct TunnelResponseBody {
    tunnel: Arc<Tunnel>,
    request_id: String,
    rx: mpsc::Receiver<StreamEvent>,
    pending: Option<Bytes>,
    finished: bool,
}

impl TunnelResponseBody {
    fn new(
        tunnel: Arc<Tunnel>,
        request_id: String,
        rx: mpsc::Receiver<StreamEvent>,
        first_chunk: Vec<u8>,
    ) -> Self {
        Self {
            tunnel,
            request_id,
            rx,
            pending: Some(Bytes::from(first_chunk)),
            finished: false,
        }
    }
}

impl Stream for TunnelResponseBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(chunk) = self.pending.take() {
            if !chunk.is_empty() {
                return Poll::Ready(Some(Ok(chunk)));
            }
        }
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.done {
                    self.finished = true;
                }
                if event.chunk.is_empty() {
                    if self.finished {
                        Poll::Ready(None)
                    } else {
                        // Zero-length keep-alive chunk; ask for the next.
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                } else {
                    Poll::Ready(Some(Ok(Bytes::from(event.chunk))))
                }
            }
            Poll::Ready(None) => {
                // Tunnel torn down mid-response.
                self.finished = true;
                Poll::Ready(Some(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "tunnel disconnected mid-response",
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TunnelResponseBody {
    fn drop(&mut self) {
        if !self.finished {
            self.tunnel.deregister(&self.request_id);
        }
    }
}
