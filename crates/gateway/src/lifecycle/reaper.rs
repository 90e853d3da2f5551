//! The idle reaper.
//!
//! A single cooperative timer fires every `reap_interval_secs`. Running
//! cloud sandboxes past their idle timeout are paused; running local
//! sandboxes with a stale tunnel heartbeat go offline. The tick holds no
//! lock across backend calls — each victim is handed to its own worker,
//! which re-checks the condition under the per-sandbox lock before acting.
//!
//! The same tick re-drives rows stuck in transient states, so failed
//! transitions converge on the next tick instead of needing a restart.

use std::sync::Arc;

use chrono::Utc;
use dd_domain::{SandboxKind, SandboxStatus};
use dd_store::Store;
use tokio_util::sync::CancellationToken;

use super::{reconcile, LifecycleManager};

/// Spawn the reaper loop. Cancels cleanly on shutdown.
pub fn spawn(
    manager: Arc<LifecycleManager>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period =
            std::time::Duration::from_secs(manager.config.limits.reap_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick(&manager).await,
            }
        }
        tracing::info!("reaper stopped");
    })
}

pub async fn tick(manager: &Arc<LifecycleManager>) {
    let running = match manager.store.sandboxes_with_status(SandboxStatus::Running).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "reaper: listing running sandboxes failed");
            return;
        }
    };

    let now = Utc::now();
    for sandbox in running {
        match sandbox.kind {
            SandboxKind::Cloud => {
                if sandbox.is_idle(now, manager.config.limits.idle_timeout_secs) {
                    tracing::info!(sandbox_id = %sandbox.id, "idle timeout reached, scheduling pause");
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.pause_if_still_idle(sandbox.id).await {
                            tracing::warn!(sandbox_id = %sandbox.id, error = %e, "idle pause failed");
                        }
                    });
                }
            }
            SandboxKind::Local => {
                if sandbox.heartbeat_stale(now, manager.config.limits.heartbeat_timeout_secs) {
                    tracing::info!(sandbox_id = %sandbox.id, "tunnel heartbeat stale, going offline");
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.offline_if_heartbeat_stale(sandbox.id).await {
                            tracing::warn!(sandbox_id = %sandbox.id, error = %e, "offline transition failed");
                        }
                    });
                }
            }
        }
    }

    // Failed or interrupted transitions are retried here rather than
    // inline with the original caller.
    reconcile::reconcile_transients(manager).await;

    manager.locks.prune_idle();
}
