//! Workspace CRUD and membership management.
//!
//! - `POST   /api/workspaces`                      — any authenticated user
//! - `GET    /api/workspaces`                      — caller's memberships
//! - `GET    /api/workspaces/:id`                  — member
//! - `DELETE /api/workspaces/:id`                  — owner (cascades sandboxes)
//! - `GET    /api/workspaces/:id/members`          — member
//! - `PUT    /api/workspaces/:id/members`          — owner; maintainer may add
//!                                                   developers/guests
//! - `DELETE /api/workspaces/:id/members/:user_id` — owner

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dd_backend::SandboxBackend;
use dd_domain::{Error, Role};
use dd_store::Store;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::auth::CurrentUser;
use crate::api::error::ApiResult;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
}

#[derive(Serialize)]
struct WorkspaceView {
    id: Uuid,
    name: String,
    role: Role,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Deserialize)]
pub struct UpsertMemberRequest {
    pub email: String,
    pub role: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Authorization helper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The caller's role in a workspace, requiring at least `min`.
/// Non-members get `NotFound` so workspace existence stays hidden.
pub async fn require_role(
    state: &AppState,
    workspace_id: Uuid,
    user_id: Uuid,
    min: Role,
) -> Result<Role, Error> {
    let role = state
        .store
        .member_role(workspace_id, user_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("workspace {workspace_id}")))?;
    if role < min {
        return Err(Error::Forbidden(format!(
            "requires {} or above",
            min.as_str()
        )));
    }
    Ok(role)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_workspace(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateWorkspaceRequest>,
) -> ApiResult<Response> {
    let name = req.name.trim();
    if name.is_empty() || name.len() > 128 {
        return Err(Error::Validation("workspace name must be 1-128 characters".into()).into());
    }
    let workspace = state.store.create_workspace(name, user.id).await?;
    tracing::info!(workspace_id = %workspace.id, user_id = %user.id, "workspace created");
    let view = WorkspaceView {
        id: workspace.id,
        name: workspace.name,
        role: Role::Owner,
        created_at: workspace.created_at,
    };
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

pub async fn list_workspaces(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    let memberships = state.store.workspaces_for_user(user.id).await?;
    let views = memberships
        .into_iter()
        .map(|(workspace, role)| {
            serde_json::json!({
                "id": workspace.id,
                "name": workspace.name,
                "role": role,
                "created_at": workspace.created_at,
            })
        })
        .collect();
    Ok(Json(views))
}

pub async fn get_workspace(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let role = require_role(&state, workspace_id, user.id, Role::Guest).await?;
    let workspace = state
        .store
        .workspace(workspace_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("workspace {workspace_id}")))?;
    Ok(Json(serde_json::json!({
        "id": workspace.id,
        "name": workspace.name,
        "role": role,
        "created_at": workspace.created_at,
    })))
}

/// Owner-only. Deletes every sandbox first (tearing down backend
/// resources), then the drive, then the row cascade.
pub async fn delete_workspace(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_role(&state, workspace_id, user.id, Role::Owner).await?;

    let sandboxes = state.store.sandboxes_in_workspace(workspace_id).await?;
    for sandbox in &sandboxes {
        state.lifecycle.delete(sandbox.id).await?;
    }
    if let Err(e) = state.backend.destroy_workspace_drive(workspace_id).await {
        tracing::warn!(workspace_id = %workspace_id, error = %e, "drive teardown failed");
    }
    state.store.delete_workspace(workspace_id).await?;
    tracing::info!(workspace_id = %workspace_id, user_id = %user.id, "workspace deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_members(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<Vec<dd_store::WorkspaceMember>>> {
    require_role(&state, workspace_id, user.id, Role::Guest).await?;
    Ok(Json(state.store.list_members(workspace_id).await?))
}

/// Add a member or change a role. Owners may grant anything; maintainers
/// may add developers and guests; a role *change* of an existing member is
/// owner-only.
pub async fn upsert_member(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<Uuid>,
    Json(req): Json<UpsertMemberRequest>,
) -> ApiResult<StatusCode> {
    let caller_role = require_role(&state, workspace_id, user.id, Role::Maintainer).await?;
    let granted = Role::parse(&req.role)?;
    if !caller_role.may_grant(granted) {
        return Err(Error::Forbidden(format!(
            "{} cannot grant {}",
            caller_role.as_str(),
            granted.as_str()
        ))
        .into());
    }

    let target = state
        .store
        .user_by_email(&req.email)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no user with email {}", req.email)))?;

    // Changing an existing member's role is reserved to owners.
    let existing = state.store.member_role(workspace_id, target.id).await?;
    if existing.is_some() && caller_role < Role::Owner {
        return Err(Error::Forbidden("only owners may change member roles".into()).into());
    }

    state
        .store
        .upsert_member(workspace_id, target.id, granted)
        .await?;
    tracing::info!(
        workspace_id = %workspace_id,
        target = %target.id,
        role = %granted,
        "member upserted"
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_member(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((workspace_id, member_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    require_role(&state, workspace_id, user.id, Role::Owner).await?;
    state.store.remove_member(workspace_id, member_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
