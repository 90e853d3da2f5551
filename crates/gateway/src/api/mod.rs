//! HTTP surface.
//!
//! Cookie-authenticated JSON endpoints under `/api/`, the upstream API
//! credential proxy under `/proxy/`, and the tunnel WebSocket upgrade.
//! Authentication is per-handler via the [`auth::CurrentUser`] extractor;
//! the tunnel and upstream-proxy routes carry their own token schemes.

pub mod auth;
pub mod codes;
pub mod error;
pub mod sandboxes;
pub mod system;
pub mod workspaces;

use axum::routing::{any, delete, get, post, put};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        // System
        .route("/api/health", get(system::health))
        .route("/api/me", get(system::me))
        // Workspaces
        .route("/api/workspaces", post(workspaces::create_workspace))
        .route("/api/workspaces", get(workspaces::list_workspaces))
        .route("/api/workspaces/:id", get(workspaces::get_workspace))
        .route("/api/workspaces/:id", delete(workspaces::delete_workspace))
        .route("/api/workspaces/:id/members", get(workspaces::list_members))
        .route("/api/workspaces/:id/members", put(workspaces::upsert_member))
        .route(
            "/api/workspaces/:id/members/:user_id",
            delete(workspaces::remove_member),
        )
        // Sandboxes
        .route(
            "/api/workspaces/:id/sandboxes",
            post(sandboxes::create_sandbox),
        )
        .route(
            "/api/workspaces/:id/sandboxes",
            get(sandboxes::list_sandboxes),
        )
        .route("/api/sandboxes/:id", get(sandboxes::get_sandbox))
        .route("/api/sandboxes/:id", delete(sandboxes::delete_sandbox))
        .route("/api/sandboxes/:id/pause", post(sandboxes::pause_sandbox))
        .route("/api/sandboxes/:id/resume", post(sandboxes::resume_sandbox))
        .route(
            "/api/sandboxes/:id/rotate-tunnel-token",
            post(sandboxes::rotate_tunnel_token),
        )
        // Registration codes
        .route(
            "/api/workspaces/:id/registration-codes",
            post(codes::mint_code),
        )
        .route("/api/registration-codes/redeem", post(codes::redeem_code))
        // Tunnel upgrade (tunnel-token authenticated)
        .route("/api/tunnel/:sandbox_id", get(crate::tunnel::ws::tunnel_ws))
        // Upstream API proxy (proxy-token authenticated)
        .route(
            "/proxy/:vendor/*path",
            any(crate::proxy::upstream::proxy_upstream),
        )
}
