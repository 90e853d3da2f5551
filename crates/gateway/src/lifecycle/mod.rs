//! Sandbox lifecycle: the status state machine and the control loops that
//! drive it.
//!
//! Every status write in the system funnels through
//! [`LifecycleManager::transition`], which checks the legal-transition table
//! and compare-and-swaps the row. Ordering follows one rule: backend calls
//! that *create* observable resources (provision, resume) run strictly
//! before the DB write that exposes them; backend calls that *destroy*
//! resources (pause, delete) run strictly after the DB write that hides
//! them. Observers never see an endpoint that no longer exists.
//!
//! HTTP handlers return as soon as the row is in its transient state; a
//! spawned worker finishes the backend work (message passing for
//! resumption — a restart mid-transition is recovered by reconciliation).

pub mod backoff;
pub mod locks;
pub mod reaper;
pub mod reconcile;

use std::sync::Arc;

use chrono::Utc;
use dd_backend::{ProvisionSpec, SandboxBackend};
use dd_domain::config::Config;
use dd_domain::quota::{self, QuotaLimits, ResourceRequest};
use dd_domain::{token, Error, Result, SandboxKind, SandboxStatus};
use dd_store::{EndpointChange, NewSandbox, Sandbox, Store};
use uuid::Uuid;

use crate::tunnel::registry::TunnelRegistry;
use backoff::Backoff;
use locks::SandboxLockMap;

/// Attempts per backend call before a transient failure is surfaced.
const BACKEND_ATTEMPTS: u32 = 3;

/// Inputs for creating a cloud sandbox.
#[derive(Debug, Clone)]
pub struct CreateSandbox {
    pub name: String,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    pub idle_timeout_secs: Option<i64>,
}

pub struct LifecycleManager {
    store: Arc<dyn Store>,
    backend: Arc<dyn SandboxBackend>,
    tunnels: Arc<TunnelRegistry>,
    config: Arc<Config>,
    locks: SandboxLockMap,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn SandboxBackend>,
        tunnels: Arc<TunnelRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            backend,
            tunnels,
            config,
            locks: SandboxLockMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// URL sandboxes use to reach the upstream API proxy.
    fn proxy_url(&self) -> String {
        format!(
            "{}://{}/proxy",
            self.config.routing.base_scheme, self.config.routing.base_domain
        )
    }

    /// Ceilings for a create: workspace quota, else the creator's user
    /// quota, else the built-in defaults.
    async fn quota_limits(&self, workspace_id: Uuid, user_id: Uuid) -> Result<QuotaLimits> {
        if let Some(q) = self.store.workspace_quota(workspace_id).await? {
            return Ok(q);
        }
        if let Some(q) = self.store.user_quota(user_id).await? {
            return Ok(q);
        }
        Ok(QuotaLimits::default())
    }

    /// The single gate every status write passes through.
    async fn transition(
        &self,
        id: Uuid,
        from: SandboxStatus,
        to: SandboxStatus,
        endpoint: EndpointChange,
    ) -> Result<()> {
        from.check_transition(to)?;
        self.store.update_status(id, from, to, endpoint).await?;
        tracing::info!(sandbox_id = %id, from = %from, to = %to, "sandbox transition");
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Create
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Validate quotas, insert the row in `creating`, and hand provisioning
    /// to a background worker. The caller gets the identifiers immediately.
    pub async fn create_cloud(
        self: Arc<Self>,
        workspace_id: Uuid,
        user_id: Uuid,
        req: CreateSandbox,
    ) -> Result<Sandbox> {
        validate_name(&req.name)?;
        let limits = self.quota_limits(workspace_id, user_id).await?;
        let usage = self.store.workspace_usage(workspace_id).await?;
        quota::check_create(
            &limits,
            &usage,
            &ResourceRequest {
                cpu_millicores: req.cpu_millicores,
                memory_bytes: req.memory_bytes,
                idle_timeout_secs: req.idle_timeout_secs,
            },
        )?;

        let sandbox = self
            .insert_with_fresh_short_id(|short_id| NewSandbox {
                id: Uuid::new_v4(),
                short_id,
                workspace_id,
                name: req.name.clone(),
                kind: SandboxKind::Cloud,
                proxy_token: token::generate_secret(),
                sandbox_token: token::generate_secret(),
                tunnel_token: None,
                cpu_millicores: req.cpu_millicores,
                memory_bytes: req.memory_bytes,
                idle_timeout_secs: req.idle_timeout_secs,
                created_by: user_id,
            })
            .await?;

        let id = sandbox.id;
        tokio::spawn(async move { self.provision_worker(id).await });

        Ok(sandbox)
    }

    /// Create a local-kind sandbox from a redeemed registration code,
    /// minting its initial tunnel token. The row stays `creating` until the
    /// first tunnel attach.
    pub async fn create_local(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        name: &str,
    ) -> Result<(Sandbox, String)> {
        validate_name(name)?;
        let limits = self.quota_limits(workspace_id, user_id).await?;
        let usage = self.store.workspace_usage(workspace_id).await?;
        if limits.max_sandboxes > 0 && usage.sandboxes + 1 > limits.max_sandboxes {
            return Err(Error::Validation(format!(
                "sandbox quota exceeded ({}/{})",
                usage.sandboxes, limits.max_sandboxes
            )));
        }

        let tunnel_token = token::generate_secret();
        let sandbox = self
            .insert_with_fresh_short_id(|short_id| NewSandbox {
                id: Uuid::new_v4(),
                short_id,
                workspace_id,
                name: name.to_string(),
                kind: SandboxKind::Local,
                proxy_token: token::generate_secret(),
                sandbox_token: token::generate_secret(),
                tunnel_token: Some(tunnel_token.clone()),
                cpu_millicores: 0,
                memory_bytes: 0,
                idle_timeout_secs: None,
                created_by: user_id,
            })
            .await?;
        Ok((sandbox, tunnel_token))
    }

    /// Insert, redrawing the short-ID on unique-index conflicts.
    async fn insert_with_fresh_short_id<F>(&self, mut build: F) -> Result<Sandbox>
    where
        F: FnMut(String) -> NewSandbox,
    {
        let mut last = None;
        for _ in 0..5 {
            let new = build(token::generate_short_id());
            match self.store.insert_sandbox(&new).await {
                Ok(sandbox) => return Ok(sandbox),
                Err(Error::Conflict(msg)) => last = Some(Error::Conflict(msg)),
                Err(other) => return Err(other),
            }
        }
        Err(last.unwrap_or_else(|| Error::Internal("sandbox insert failed".into())))
    }

    /// Background worker: drive a `creating` row to `running`, or tear it
    /// down on permanent failure.
    pub async fn provision_worker(self: Arc<Self>, id: Uuid) {
        let _permit = self.locks.acquire(id).await;
        let Ok(Some(sandbox)) = self.store.sandbox(id).await else {
            return;
        };
        if sandbox.status != SandboxStatus::Creating {
            return;
        }

        match self.provision_once(&sandbox).await {
            Ok(endpoint) => {
                // Backend resource exists; expose it. If the row was deleted
                // while we provisioned, tear the resource back down.
                if let Err(e) = self
                    .transition(
                        id,
                        SandboxStatus::Creating,
                        SandboxStatus::Running,
                        EndpointChange::Set(endpoint),
                    )
                    .await
                {
                    tracing::warn!(sandbox_id = %id, error = %e, "row moved during provision");
                    let _ = self.backend.destroy(id).await;
                }
            }
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "provision failed");
                if self
                    .transition(
                        id,
                        SandboxStatus::Creating,
                        SandboxStatus::Deleting,
                        EndpointChange::Clear,
                    )
                    .await
                    .is_ok()
                {
                    let _ = self.backend.destroy(id).await;
                    let _ = self.store.remove_sandbox(id).await;
                }
            }
        }
    }

    /// Ensure the workspace drive, then provision with bounded retries.
    async fn provision_once(&self, sandbox: &Sandbox) -> Result<String> {
        let limits = self
            .quota_limits(sandbox.workspace_id, sandbox.created_by)
            .await?;
        let volume = self
            .backend
            .ensure_workspace_drive(sandbox.workspace_id, limits.max_drive_bytes)
            .await?;
        self.store
            .record_workspace_volume(sandbox.workspace_id, &volume, limits.max_drive_bytes)
            .await?;

        let spec = ProvisionSpec {
            sandbox_id: sandbox.id,
            workspace_id: sandbox.workspace_id,
            cpu_millicores: sandbox.cpu_millicores,
            memory_bytes: sandbox.memory_bytes,
            sandbox_token: sandbox.sandbox_token.clone(),
            proxy_url: self.proxy_url(),
            proxy_token: sandbox.proxy_token.clone(),
        };
        self.with_retries(|| self.backend.provision(&spec)).await
    }

    /// Run a backend call, retrying transient failures with jittered
    /// exponential backoff.
    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = Backoff::default();
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < BACKEND_ATTEMPTS => {
                    attempt += 1;
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64,
                        "transient backend failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Pause / resume
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Pause a running cloud sandbox. Pausing a `paused` sandbox is a
    /// no-op success.
    pub async fn pause(&self, id: Uuid) -> Result<Sandbox> {
        let _permit = self.locks.acquire(id).await;
        let sandbox = self.load(id).await?;
        self.pause_locked(sandbox).await
    }

    /// Reaper entry point: re-checks idleness under the lock so a sandbox
    /// whose activity advanced during evaluation is never paused.
    pub async fn pause_if_still_idle(&self, id: Uuid) -> Result<()> {
        let _permit = self.locks.acquire(id).await;
        let sandbox = self.load(id).await?;
        if sandbox.status != SandboxStatus::Running {
            return Ok(());
        }
        if !sandbox.is_idle(Utc::now(), self.config.limits.idle_timeout_secs) {
            return Ok(());
        }
        self.pause_locked(sandbox).await.map(|_| ())
    }

    async fn pause_locked(&self, sandbox: Sandbox) -> Result<Sandbox> {
        if sandbox.kind != SandboxKind::Cloud {
            return Err(Error::Validation(
                "local sandboxes pause by disconnecting their tunnel".into(),
            ));
        }
        match sandbox.status {
            SandboxStatus::Paused => return Ok(sandbox),
            SandboxStatus::Running => {}
            other => {
                return Err(Error::Conflict(format!(
                    "cannot pause a {other} sandbox"
                )))
            }
        }

        let id = sandbox.id;
        // Hide the sandbox first; the proxy 503s from here on. The backend
        // teardown follows, so the stored endpoint always outlives the pod.
        self.transition(
            id,
            SandboxStatus::Running,
            SandboxStatus::Pausing,
            EndpointChange::Keep,
        )
        .await?;
        self.with_retries(|| self.backend.pause(id)).await?;
        self.transition(
            id,
            SandboxStatus::Pausing,
            SandboxStatus::Paused,
            EndpointChange::Clear,
        )
        .await?;
        self.load(id).await
    }

    /// Resume a paused cloud sandbox; legal only from `paused`.
    pub async fn resume(&self, id: Uuid) -> Result<Sandbox> {
        let _permit = self.locks.acquire(id).await;
        let sandbox = self.load(id).await?;
        if sandbox.kind != SandboxKind::Cloud {
            return Err(Error::Validation(
                "local sandboxes resume by reconnecting their tunnel".into(),
            ));
        }
        self.transition(
            id,
            sandbox.status,
            SandboxStatus::Resuming,
            EndpointChange::Keep,
        )
        .await?;
        // Bring the resource up before exposing it.
        let endpoint = self.with_retries(|| self.backend.resume(id)).await?;
        self.transition(
            id,
            SandboxStatus::Resuming,
            SandboxStatus::Running,
            EndpointChange::Set(endpoint),
        )
        .await?;
        // A resume counts as activity, or the reaper would re-pause it on
        // its next tick.
        self.store.touch_activity(id).await?;
        self.load(id).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Delete
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Delete from any state. Deleting an already-deleted sandbox is a
    /// no-op success.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let _permit = self.locks.acquire(id).await;
        let Some(sandbox) = self.store.sandbox(id).await? else {
            return Ok(());
        };
        if sandbox.status != SandboxStatus::Deleting {
            self.transition(id, sandbox.status, SandboxStatus::Deleting, EndpointChange::Clear)
                .await?;
        }
        self.tunnels.remove(id);

        if sandbox.kind == SandboxKind::Cloud {
            // Best-effort teardown; a transient failure leaves the row in
            // `deleting` for the next reconciliation tick.
            match self.with_retries(|| self.backend.destroy(id)).await {
                Ok(()) => {
                    self.store.remove_sandbox(id).await?;
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %id, error = %e,
                        "backend destroy failed, deferring to reconciliation");
                }
            }
        } else {
            self.store.remove_sandbox(id).await?;
        }
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tunnel observations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// A tunnel connected and authenticated for this local sandbox.
    pub async fn observe_tunnel_attach(&self, id: Uuid) -> Result<Sandbox> {
        let _permit = self.locks.acquire(id).await;
        let sandbox = self.load(id).await?;
        if sandbox.kind != SandboxKind::Local {
            return Err(Error::Validation("not a local sandbox".into()));
        }
        match sandbox.status {
            SandboxStatus::Deleting => {
                return Err(Error::Conflict("sandbox is being deleted".into()))
            }
            // Replacement connection; nothing to transition.
            SandboxStatus::Running => {}
            SandboxStatus::Offline => {
                self.transition(id, SandboxStatus::Offline, SandboxStatus::Running, EndpointChange::Keep)
                    .await?;
            }
            // First attach after registration.
            SandboxStatus::Creating => {
                self.transition(id, SandboxStatus::Creating, SandboxStatus::Running, EndpointChange::Keep)
                    .await?;
            }
            other => {
                return Err(Error::Conflict(format!(
                    "tunnel attach while {other}"
                )))
            }
        }
        self.store.touch_heartbeat(id).await?;
        self.load(id).await
    }

    /// The tunnel for this sandbox went away.
    pub async fn observe_tunnel_detach(&self, id: Uuid) {
        let _permit = self.locks.acquire(id).await;
        match self.store.sandbox(id).await {
            Ok(Some(sandbox)) if sandbox.status == SandboxStatus::Running => {
                if let Err(e) = self
                    .transition(id, SandboxStatus::Running, SandboxStatus::Offline, EndpointChange::Keep)
                    .await
                {
                    tracing::warn!(sandbox_id = %id, error = %e, "tunnel detach transition");
                }
            }
            _ => {}
        }
    }

    /// Reaper entry point for stale local heartbeats; re-checks under the
    /// lock like the idle path.
    pub async fn offline_if_heartbeat_stale(&self, id: Uuid) -> Result<()> {
        let _permit = self.locks.acquire(id).await;
        let sandbox = self.load(id).await?;
        if sandbox.kind != SandboxKind::Local || sandbox.status != SandboxStatus::Running {
            return Ok(());
        }
        if !sandbox.heartbeat_stale(Utc::now(), self.config.limits.heartbeat_timeout_secs) {
            return Ok(());
        }
        self.tunnels.remove(id);
        self.transition(id, SandboxStatus::Running, SandboxStatus::Offline, EndpointChange::Keep)
            .await
    }

    async fn load(&self, id: Uuid) -> Result<Sandbox> {
        self.store
            .sandbox(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sandbox {id}")))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::Validation(
            "sandbox name must be 1-64 characters".into(),
        ));
    }
    Ok(())
}
