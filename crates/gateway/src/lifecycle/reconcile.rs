//! State convergence after crashes and failed transitions.
//!
//! On startup the manager lists backend resources tagged as ours and
//! cross-references the store: resources with no row are destroyed, and
//! rows stuck in transient states are driven toward their terminal intent
//! by consulting the backend's *observed* status — never by guessing.

use std::collections::HashSet;
use std::sync::Arc;

use dd_backend::{ObservedStatus, SandboxBackend};
use dd_domain::{SandboxKind, SandboxStatus};
use dd_store::{EndpointChange, Store};
use uuid::Uuid;

use super::LifecycleManager;

/// Full startup reconciliation: orphan sweep + transient-state recovery.
pub async fn run(manager: &Arc<LifecycleManager>) {
    sweep_orphans(manager).await;
    reconcile_transients(manager).await;
}

/// Destroy backend resources the store has no row for.
async fn sweep_orphans(manager: &Arc<LifecycleManager>) {
    let owned = match manager.backend.list_owned().await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(error = %e, "orphan sweep: listing backend resources failed");
            return;
        }
    };
    let known: HashSet<Uuid> = match manager.store.all_sandboxes().await {
        Ok(rows) => rows.iter().map(|sb| sb.id).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "orphan sweep: listing sandboxes failed");
            return;
        }
    };
    for id in owned {
        if !known.contains(&id) {
            tracing::info!(sandbox_id = %id, "destroying orphaned backend resource");
            if let Err(e) = manager.backend.destroy(id).await {
                tracing::warn!(sandbox_id = %id, error = %e, "orphan destroy failed");
            }
        }
    }
}

/// Drive every transient row toward its terminal intent. Called at startup
/// and again on every reaper tick, so failures converge without restarts.
pub async fn reconcile_transients(manager: &Arc<LifecycleManager>) {
    let rows = match manager.store.all_sandboxes().await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "reconcile: listing sandboxes failed");
            return;
        }
    };

    for sandbox in rows {
        if !sandbox.status.is_transient() {
            continue;
        }
        // Local rows sit in `creating` until their first tunnel attach;
        // only their deletes need convergence.
        if sandbox.kind == SandboxKind::Local {
            if sandbox.status == SandboxStatus::Deleting {
                let _ = manager.store.remove_sandbox(sandbox.id).await;
            }
            continue;
        }
        let manager = manager.clone();
        tokio::spawn(async move {
            reconcile_one(&manager, sandbox.id, sandbox.status).await;
        });
    }
}

async fn reconcile_one(manager: &Arc<LifecycleManager>, id: Uuid, seen: SandboxStatus) {
    let _permit = manager.locks.acquire(id).await;

    // Reload under the lock; an in-flight worker may already have moved it.
    let Ok(Some(sandbox)) = manager.store.sandbox(id).await else {
        return;
    };
    if sandbox.status != seen {
        return;
    }

    let observed = match manager.backend.observed_status(id).await {
        Ok(observed) => observed,
        Err(e) => {
            tracing::warn!(sandbox_id = %id, error = %e, "reconcile: observe failed");
            return;
        }
    };

    let outcome = match (sandbox.status, observed) {
        // ── creating: intent is running ───────────────────────────────
        (SandboxStatus::Creating, ObservedStatus::Ready { endpoint }) => {
            manager
                .transition(id, SandboxStatus::Creating, SandboxStatus::Running, EndpointChange::Set(endpoint))
                .await
        }
        (SandboxStatus::Creating, ObservedStatus::Stopped) => {
            match manager.backend.resume(id).await {
                Ok(endpoint) => {
                    manager
                        .transition(id, SandboxStatus::Creating, SandboxStatus::Running, EndpointChange::Set(endpoint))
                        .await
                }
                Err(e) => Err(e),
            }
        }
        (SandboxStatus::Creating, ObservedStatus::Absent) => {
            // Provision never landed; run the create path again.
            let manager = manager.clone();
            drop(_permit);
            manager.provision_worker(id).await;
            return;
        }

        // ── pausing: intent is paused ─────────────────────────────────
        (SandboxStatus::Pausing, ObservedStatus::Stopped | ObservedStatus::Absent) => {
            manager
                .transition(id, SandboxStatus::Pausing, SandboxStatus::Paused, EndpointChange::Clear)
                .await
        }
        (SandboxStatus::Pausing, ObservedStatus::Ready { .. }) => {
            match manager.backend.pause(id).await {
                Ok(()) => {
                    manager
                        .transition(id, SandboxStatus::Pausing, SandboxStatus::Paused, EndpointChange::Clear)
                        .await
                }
                Err(e) => Err(e),
            }
        }

        // ── resuming: intent is running ───────────────────────────────
        (SandboxStatus::Resuming, ObservedStatus::Ready { endpoint }) => {
            let result = manager
                .transition(id, SandboxStatus::Resuming, SandboxStatus::Running, EndpointChange::Set(endpoint))
                .await;
            if result.is_ok() {
                let _ = manager.store.touch_activity(id).await;
            }
            result
        }
        (SandboxStatus::Resuming, ObservedStatus::Stopped) => {
            match manager.backend.resume(id).await {
                Ok(endpoint) => {
                    let result = manager
                        .transition(id, SandboxStatus::Resuming, SandboxStatus::Running, EndpointChange::Set(endpoint))
                        .await;
                    if result.is_ok() {
                        let _ = manager.store.touch_activity(id).await;
                    }
                    result
                }
                Err(e) => Err(e),
            }
        }
        (SandboxStatus::Resuming, ObservedStatus::Absent) => {
            // The resource is gone for good; fold into delete.
            let _ = manager
                .transition(id, SandboxStatus::Resuming, SandboxStatus::Deleting, EndpointChange::Clear)
                .await;
            let _ = manager.backend.destroy(id).await;
            manager.store.remove_sandbox(id).await
        }

        // ── deleting: intent is gone ──────────────────────────────────
        (SandboxStatus::Deleting, _) => match manager.backend.destroy(id).await {
            Ok(()) => manager.store.remove_sandbox(id).await,
            Err(e) => Err(e),
        },

        // Non-transient states never reach here.
        (status, observed) => {
            tracing::debug!(sandbox_id = %id, %status, ?observed, "reconcile: nothing to do");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        tracing::warn!(sandbox_id = %id, error = %e, "reconcile attempt failed, will retry next tick");
    }
}
