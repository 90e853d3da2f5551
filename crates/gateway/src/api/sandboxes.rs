//! Sandbox CRUD and transition endpoints.
//!
//! - `POST   /api/workspaces/:id/sandboxes` — developer+
//! - `GET    /api/workspaces/:id/sandboxes` — member
//! - `GET    /api/sandboxes/:id`            — member
//! - `POST   /api/sandboxes/:id/pause`      — developer+
//! - `POST   /api/sandboxes/:id/resume`     — developer+
//! - `DELETE /api/sandboxes/:id`            — developer+
//! - `POST   /api/sandboxes/:id/rotate-tunnel-token` — developer+, local kind

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use dd_domain::{token, Error, Role, SandboxKind, SandboxStatus};
use dd_store::{Sandbox, Store};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::auth::CurrentUser;
use crate::api::error::{ApiError, ApiResult};
use crate::api::workspaces::require_role;
use crate::lifecycle::CreateSandbox;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct CreateSandboxRequest {
    pub name: String,
    #[serde(default = "d_cpu")]
    pub cpu_millicores: i64,
    #[serde(default = "d_memory")]
    pub memory_bytes: i64,
    #[serde(default)]
    pub idle_timeout_secs: Option<i64>,
}

fn d_cpu() -> i64 {
    1000
}
fn d_memory() -> i64 {
    1024 * 1024 * 1024
}

/// The API shape of a sandbox. Tokens never leave the server this way.
#[derive(Serialize)]
pub struct SandboxView {
    pub id: Uuid,
    pub short_id: String,
    pub workspace_id: Uuid,
    pub name: String,
    pub kind: SandboxKind,
    pub status: SandboxStatus,
    /// Browser-facing URL on the sandbox subdomain.
    pub url: String,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    pub idle_timeout_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
}

impl SandboxView {
    pub fn from_sandbox(sandbox: &Sandbox, state: &AppState) -> Self {
        let routing = &state.config.routing;
        Self {
            id: sandbox.id,
            short_id: sandbox.short_id.clone(),
            workspace_id: sandbox.workspace_id,
            name: sandbox.name.clone(),
            kind: sandbox.kind,
            status: sandbox.status,
            url: format!(
                "{}://{}.{}",
                routing.base_scheme, sandbox.short_id, routing.base_domain
            ),
            cpu_millicores: sandbox.cpu_millicores,
            memory_bytes: sandbox.memory_bytes,
            idle_timeout_secs: sandbox.idle_timeout_secs,
            created_at: sandbox.created_at,
            last_activity_at: sandbox.last_activity_at,
            paused_at: sandbox.paused_at,
        }
    }
}

/// Load a sandbox and check the caller's role in its workspace.
async fn load_authorized(
    state: &AppState,
    user_id: Uuid,
    sandbox_id: Uuid,
    min: Role,
) -> Result<Sandbox, Error> {
    let sandbox = state
        .store
        .sandbox(sandbox_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("sandbox {sandbox_id}")))?;
    // Non-members see 404 here too, by way of require_role.
    require_role(state, sandbox.workspace_id, user_id, min).await?;
    Ok(sandbox)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_sandbox(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<Uuid>,
    Json(req): Json<CreateSandboxRequest>,
) -> ApiResult<Response> {
    require_role(&state, workspace_id, user.id, Role::Developer).await?;
    let sandbox = state
        .lifecycle
        .clone()
        .create_cloud(
            workspace_id,
            user.id,
            CreateSandbox {
                name: req.name,
                cpu_millicores: req.cpu_millicores,
                memory_bytes: req.memory_bytes,
                idle_timeout_secs: req.idle_timeout_secs,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SandboxView::from_sandbox(&sandbox, &state)),
    )
        .into_response())
}

pub async fn list_sandboxes(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<Vec<SandboxView>>> {
    require_role(&state, workspace_id, user.id, Role::Guest).await?;
    let sandboxes = state.store.sandboxes_in_workspace(workspace_id).await?;
    Ok(Json(
        sandboxes
            .iter()
            .map(|sb| SandboxView::from_sandbox(sb, &state))
            .collect(),
    ))
}

pub async fn get_sandbox(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sandbox_id): Path<Uuid>,
) -> ApiResult<Json<SandboxView>> {
    let sandbox = load_authorized(&state, user.id, sandbox_id, Role::Guest).await?;
    Ok(Json(SandboxView::from_sandbox(&sandbox, &state)))
}

pub async fn pause_sandbox(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sandbox_id): Path<Uuid>,
) -> ApiResult<Json<SandboxView>> {
    load_authorized(&state, user.id, sandbox_id, Role::Developer).await?;
    let sandbox = state.lifecycle.pause(sandbox_id).await?;
    Ok(Json(SandboxView::from_sandbox(&sandbox, &state)))
}

pub async fn resume_sandbox(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sandbox_id): Path<Uuid>,
) -> ApiResult<Json<SandboxView>> {
    load_authorized(&state, user.id, sandbox_id, Role::Developer).await?;
    let sandbox = state.lifecycle.resume(sandbox_id).await?;
    Ok(Json(SandboxView::from_sandbox(&sandbox, &state)))
}

pub async fn delete_sandbox(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sandbox_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    // Deleting an already-gone sandbox is a success; a present one still
    // goes through the membership check.
    let Some(sandbox) = state.store.sandbox(sandbox_id).await.map_err(ApiError::from)? else {
        return Ok(StatusCode::NO_CONTENT);
    };
    require_role(&state, sandbox.workspace_id, user.id, Role::Developer).await?;
    state.lifecycle.delete(sandbox_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Mint a fresh tunnel token for a local sandbox, invalidating the old one
/// and dropping any live tunnel that used it.
pub async fn rotate_tunnel_token(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sandbox_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let sandbox = load_authorized(&state, user.id, sandbox_id, Role::Developer).await?;
    if sandbox.kind != SandboxKind::Local {
        return Err(Error::Validation("only local sandboxes have tunnel tokens".into()).into());
    }
    let fresh = token::generate_secret();
    state.store.rotate_tunnel_token(sandbox_id, &fresh).await?;
    state.tunnels.remove(sandbox_id);
    state.lifecycle.observe_tunnel_detach(sandbox_id).await;
    tracing::info!(sandbox_id = %sandbox_id, "tunnel token rotated");
    Ok(Json(serde_json::json!({ "tunnel_token": fresh })))
}
