//! Health probe and caller identity.

use axum::extract::State;
use axum::Json;

use crate::api::auth::CurrentUser;
use crate::state::AppState;

/// GET /api/health — public liveness probe.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tunnels": state.tunnels.len(),
    }))
}

/// GET /api/me — the authenticated caller.
pub async fn me(CurrentUser(user): CurrentUser) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "id": user.id,
        "email": user.email,
        "display_name": user.display_name,
    }))
}
