//! Durable state for the drydock control plane.
//!
//! The gateway consumes the [`Store`] trait, not the Postgres type, so the
//! lifecycle manager, reaper, and reconciler are testable against the
//! in-memory fake (`mem`, behind the `test-support` feature).
//!
//! All sandbox status writes go through [`Store::update_status`], which
//! compare-and-swaps on the expected current status; the lifecycle manager
//! layers the legal-transition check on top.

pub mod models;
pub mod pg;

#[cfg(any(test, feature = "test-support"))]
pub mod mem;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dd_domain::quota::{QuotaLimits, QuotaUsage};
use dd_domain::{Result, Role, SandboxStatus};
use uuid::Uuid;

pub use models::{
    CodeBinding, NewSandbox, Sandbox, User, Workspace, WorkspaceMember, WorkspaceVolume,
};
pub use pg::PgStore;

/// What happens to the stored endpoint alongside a status write.
///
/// Folding this into the status update keeps the two observable fields in
/// one atomic write: a sandbox is never seen `running` without its endpoint
/// or with an endpoint that no longer exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointChange {
    Keep,
    Set(String),
    Clear,
}

/// Persistence surface the gateway depends on.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ── Users & auth ──────────────────────────────────────────────────

    /// Resolve a session-cookie digest to its user, if the token exists and
    /// has not expired.
    async fn user_by_session_digest(&self, digest: &str) -> Result<Option<User>>;

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn user_by_email(&self, email: &str) -> Result<Option<User>>;

    // ── Workspaces & membership ───────────────────────────────────────

    /// Create a workspace with `owner` as its owner member.
    async fn create_workspace(&self, name: &str, owner: Uuid) -> Result<Workspace>;

    async fn workspace(&self, id: Uuid) -> Result<Option<Workspace>>;

    async fn workspaces_for_user(&self, user_id: Uuid) -> Result<Vec<(Workspace, Role)>>;

    /// Delete a workspace; sandboxes, members, volume rows cascade.
    async fn delete_workspace(&self, id: Uuid) -> Result<()>;

    async fn member_role(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Role>>;

    async fn upsert_member(&self, workspace_id: Uuid, user_id: Uuid, role: Role) -> Result<()>;

    async fn remove_member(&self, workspace_id: Uuid, user_id: Uuid) -> Result<()>;

    async fn list_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>>;

    // ── Workspace volumes ─────────────────────────────────────────────

    async fn workspace_volume(&self, workspace_id: Uuid) -> Result<Option<WorkspaceVolume>>;

    async fn record_workspace_volume(
        &self,
        workspace_id: Uuid,
        volume_name: &str,
        size_bytes: i64,
    ) -> Result<()>;

    // ── Sandboxes ─────────────────────────────────────────────────────

    /// Insert a new sandbox row in state `creating`.
    /// A short-ID collision surfaces as `Conflict` so the caller can redraw.
    async fn insert_sandbox(&self, new: &NewSandbox) -> Result<Sandbox>;

    async fn sandbox(&self, id: Uuid) -> Result<Option<Sandbox>>;

    async fn sandbox_by_short_id(&self, short_id: &str) -> Result<Option<Sandbox>>;

    /// Indexed lookup used by the upstream API proxy on every request.
    async fn sandbox_by_proxy_token(&self, token: &str) -> Result<Option<Sandbox>>;

    async fn sandboxes_in_workspace(&self, workspace_id: Uuid) -> Result<Vec<Sandbox>>;

    async fn sandboxes_with_status(&self, status: SandboxStatus) -> Result<Vec<Sandbox>>;

    /// Every sandbox row; used by startup reconciliation and orphan sweeps.
    async fn all_sandboxes(&self) -> Result<Vec<Sandbox>>;

    /// Compare-and-swap the status, atomically applying the endpoint
    /// change. Fails with `Conflict` if the row is no longer in `from`
    /// (someone else won the race). Entering `paused` records `paused_at`;
    /// entering `running` clears it.
    async fn update_status(
        &self,
        id: Uuid,
        from: SandboxStatus,
        to: SandboxStatus,
        endpoint: EndpointChange,
    ) -> Result<()>;

    /// Record a user HTTP hit for the idle reaper.
    async fn touch_activity(&self, id: Uuid) -> Result<()>;

    /// Record tunnel liveness for a local sandbox.
    async fn touch_heartbeat(&self, id: Uuid) -> Result<()>;

    async fn rotate_tunnel_token(&self, id: Uuid, token: &str) -> Result<()>;

    /// Remove the row outright (terminal step of delete).
    async fn remove_sandbox(&self, id: Uuid) -> Result<()>;

    /// CPU/memory/count usage of non-deleting sandboxes in a workspace.
    async fn workspace_usage(&self, workspace_id: Uuid) -> Result<QuotaUsage>;

    // ── Quotas ────────────────────────────────────────────────────────

    async fn workspace_quota(&self, workspace_id: Uuid) -> Result<Option<QuotaLimits>>;

    async fn user_quota(&self, user_id: Uuid) -> Result<Option<QuotaLimits>>;

    // ── Registration codes ────────────────────────────────────────────

    async fn insert_registration_code(
        &self,
        code_digest: &str,
        workspace_id: Uuid,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Atomically redeem a code: single use, TTL checked in the same
    /// statement. Returns the bound (workspace, user) on success.
    async fn redeem_registration_code(&self, code_digest: &str) -> Result<Option<CodeBinding>>;
}
