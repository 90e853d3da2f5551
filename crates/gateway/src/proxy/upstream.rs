//! Upstream API credential proxy.
//!
//! Sandboxes talk to the outside model API through
//! `/proxy/<vendor>/<path>`, authenticating with their per-sandbox proxy
//! token. The token is verified against the store, swapped for the
//! operator's real credential, and the request is streamed through. The
//! real key never enters a sandbox.
//!
//! Tokens of non-running sandboxes still work: traffic keeps flowing during
//! brief status flux. Only unknown tokens are rejected.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use dd_store::Store;

use crate::proxy::headers::{strip_credentials, strip_hop_by_hop};
use crate::state::AppState;

/// Any-method handler for `/proxy/:vendor/*path`.
pub async fn proxy_upstream(
    State(state): State<AppState>,
    Path((vendor, path)): Path<(String, String)>,
    req: Request,
) -> Response {
    // Bearer or x-api-key, depending on what shape the vendor SDK emits.
    let provided = bearer_token(req.headers())
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    if provided.is_empty() {
        return unauthorized("missing proxy token");
    }

    let sandbox = match state.store.sandbox_by_proxy_token(&provided).await {
        Ok(Some(sb)) => sb,
        Ok(None) => return unauthorized("unknown proxy token"),
        Err(e) => {
            tracing::error!(error = %e, "proxy token lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let base = state.config.upstream.base_url.trim_end_matches('/');
    if base.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({ "error": "upstream proxy is not configured" })),
        )
            .into_response();
    }
    let Some(key) = state.upstream_key.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({ "error": "upstream credential is not configured" })),
        )
            .into_response();
    };

    let (parts, body) = req.into_parts();
    let query = parts
        .uri
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let url = format!("{base}/{path}{query}");

    let mut headers = strip_hop_by_hop(&parts.headers);
    strip_credentials(&mut headers);
    // Re-sign with the operator credential in the vendor's header shape.
    if vendor == "anthropic" {
        if let Ok(mut value) = HeaderValue::from_str(&key) {
            value.set_sensitive(true);
            headers.insert(HeaderName::from_static("x-api-key"), value);
        }
    } else if let Ok(mut value) = HeaderValue::from_str(&format!("Bearer {key}")) {
        value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, value);
    }

    tracing::debug!(
        sandbox_id = %sandbox.id,
        vendor = %vendor,
        path = %path,
        "forwarding upstream API call"
    );

    let outbound = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    match outbound {
        // Whatever upstream said — status, headers, body — is relayed
        // verbatim, streaming.
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
            tracing::warn!(error = %e, "upstream call failed");
            (
                StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({ "error": "upstream unreachable" })),
            )
                .into_response()
        }
    }
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({ "error": detail })),
    )
        .into_response()
}
