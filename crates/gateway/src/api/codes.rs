//! Agent registration codes.
//!
//! A developer mints a single-use, short-lived code bound to
//! (workspace, user). The user-local agent redeems it — the code itself is
//! the credential — which creates a local-kind sandbox and returns its
//! tunnel token. The raw code is never stored, only its digest.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use dd_domain::{token, Error, Role};
use dd_store::Store;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::CurrentUser;
use crate::api::error::ApiResult;
use crate::api::sandboxes::SandboxView;
use crate::api::workspaces::require_role;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RedeemRequest {
    pub code: String,
    #[serde(default = "d_name")]
    pub name: String,
}

fn d_name() -> String {
    "local-agent".into()
}

/// POST /api/workspaces/:id/registration-codes — developer+.
pub async fn mint_code(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Response> {
    require_role(&state, workspace_id, user.id, Role::Developer).await?;

    let code = token::generate_secret();
    let ttl = state.config.limits.code_ttl_secs();
    let expires_at = Utc::now() + Duration::seconds(ttl);
    state
        .store
        .insert_registration_code(&token::token_digest(&code), workspace_id, user.id, expires_at)
        .await?;
    tracing::info!(workspace_id = %workspace_id, user_id = %user.id, ttl_secs = ttl,
        "registration code minted");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "code": code,
            "expires_at": expires_at,
        })),
    )
        .into_response())
}

/// POST /api/registration-codes/redeem — authenticated by the code alone.
pub async fn redeem_code(
    State(state): State<AppState>,
    Json(req): Json<RedeemRequest>,
) -> ApiResult<Response> {
    let binding = state
        .store
        .redeem_registration_code(&token::token_digest(&req.code))
        .await?
        .ok_or_else(|| Error::Auth("invalid, expired, or already-used code".into()))?;

    let (sandbox, tunnel_token) = state
        .lifecycle
        .create_local(binding.workspace_id, binding.user_id, &req.name)
        .await?;
    tracing::info!(
        sandbox_id = %sandbox.id,
        workspace_id = %binding.workspace_id,
        "local sandbox registered"
    );

    let routing = &state.config.routing;
    let tunnel_url = format!(
        "{}://{}/api/tunnel/{}",
        if routing.base_scheme == "https" { "wss" } else { "ws" },
        routing.base_domain,
        sandbox.id,
    );
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "sandbox": SandboxView::from_sandbox(&sandbox, &state),
            "tunnel_token": tunnel_token,
            "tunnel_url": tunnel_url,
        })),
    )
        .into_response())
}
