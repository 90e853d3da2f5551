//! Lifecycle manager behavior against an in-memory store and a scripted
//! backend: transition legality, idempotence, reaping, and convergence
//! after failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dd_backend::scripted::ScriptedBackend;
use dd_backend::{ObservedStatus, SandboxBackend};
use dd_domain::config::Config;
use dd_domain::SandboxStatus;
use dd_gateway::lifecycle::{reaper, reconcile, CreateSandbox, LifecycleManager};
use dd_gateway::tunnel::registry::TunnelRegistry;
use dd_store::mem::MemStore;
use dd_store::{Sandbox, Store};
use uuid::Uuid;

struct Fixture {
    store: Arc<MemStore>,
    backend: Arc<ScriptedBackend>,
    manager: Arc<LifecycleManager>,
    workspace_id: Uuid,
    user_id: Uuid,
}

async fn fixture() -> Fixture {
    let mut config = Config::default();
    config.routing.base_domain = "box.example.com".into();
    config.limits.idle_timeout_secs = 30;
    config.limits.heartbeat_timeout_secs = 90;

    let store = Arc::new(MemStore::new());
    let backend = Arc::new(ScriptedBackend::new());
    let manager = Arc::new(LifecycleManager::new(
        store.clone(),
        backend.clone(),
        Arc::new(TunnelRegistry::new()),
        Arc::new(config),
    ));

    let user_id = store.add_user("dev@example.com");
    let workspace_id = store
        .create_workspace("team", user_id)
        .await
        .expect("create workspace")
        .id;

    Fixture { store, backend, manager, workspace_id, user_id }
}

fn create_request(name: &str) -> CreateSandbox {
    CreateSandbox {
        name: name.into(),
        cpu_millicores: 1000,
        memory_bytes: 1 << 30,
        idle_timeout_secs: None,
    }
}

async fn wait_for_status(store: &MemStore, id: Uuid, status: SandboxStatus) -> Sandbox {
    for _ in 0..600 {
        if let Some(sb) = store.sandbox(id).await.unwrap() {
            if sb.status == status {
                return sb;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("sandbox {id} never reached {status}");
}

async fn wait_for_removal(store: &MemStore, id: Uuid) {
    for _ in 0..200 {
        if store.sandbox(id).await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("sandbox {id} was never removed");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Create
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn create_provisions_to_running_with_endpoint() {
    let fx = fixture().await;
    let sandbox = fx
        .manager
        .clone()
        .create_cloud(fx.workspace_id, fx.user_id, create_request("dev"))
        .await
        .unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Creating);
    assert_eq!(sandbox.short_id.len(), 16);
    assert!(sandbox.endpoint.is_none());

    let running = wait_for_status(&fx.store, sandbox.id, SandboxStatus::Running).await;
    assert!(running.endpoint.is_some(), "running cloud sandbox must have an endpoint");
    // Workspace drive was provisioned along the way.
    assert!(fx.store.workspace_volume(fx.workspace_id).await.unwrap().is_some());
}

#[tokio::test]
async fn fatal_provision_failure_removes_the_row() {
    let fx = fixture().await;
    fx.backend.fail_next_provision_fatal();
    let sandbox = fx
        .manager
        .clone()
        .create_cloud(fx.workspace_id, fx.user_id, create_request("doomed"))
        .await
        .unwrap();
    wait_for_removal(&fx.store, sandbox.id).await;
    assert!(!fx.backend.resource_exists(sandbox.id));
}

#[tokio::test]
async fn quota_violation_rejects_create_without_state_change() {
    let fx = fixture().await;
    fx.store.set_workspace_quota(
        fx.workspace_id,
        dd_domain::quota::QuotaLimits { max_sandboxes: 1, ..Default::default() },
    );
    fx.manager
        .clone()
        .create_cloud(fx.workspace_id, fx.user_id, create_request("one"))
        .await
        .unwrap();
    let err = fx
        .manager
        .clone()
        .create_cloud(fx.workspace_id, fx.user_id, create_request("two"))
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 400);
    assert_eq!(fx.store.workspace_usage(fx.workspace_id).await.unwrap().sandboxes, 1);
}

#[tokio::test]
async fn concurrent_creates_draw_unique_short_ids() {
    let fx = fixture().await;
    let mut handles = Vec::new();
    for i in 0..50 {
        let manager = fx.manager.clone();
        let ws = fx.workspace_id;
        let user = fx.user_id;
        handles.push(tokio::spawn(async move {
            manager.create_cloud(ws, user, create_request(&format!("sb-{i}"))).await
        }));
    }
    let mut short_ids = std::collections::HashSet::new();
    for handle in handles {
        let sandbox = handle.await.unwrap().unwrap();
        assert!(short_ids.insert(sandbox.short_id.to_lowercase()));
    }
    assert_eq!(short_ids.len(), 50);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pause / resume
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn running_sandbox(fx: &Fixture) -> Sandbox {
    let sandbox = fx
        .manager
        .clone()
        .create_cloud(fx.workspace_id, fx.user_id, create_request("dev"))
        .await
        .unwrap();
    wait_for_status(&fx.store, sandbox.id, SandboxStatus::Running).await
}

#[tokio::test]
async fn pause_clears_endpoint_and_records_paused_at() {
    let fx = fixture().await;
    let sandbox = running_sandbox(&fx).await;

    let paused = fx.manager.pause(sandbox.id).await.unwrap();
    assert_eq!(paused.status, SandboxStatus::Paused);
    assert!(paused.endpoint.is_none(), "paused sandbox must not expose an endpoint");
    assert!(paused.paused_at.is_some());
}

#[tokio::test]
async fn pause_is_idempotent() {
    let fx = fixture().await;
    let sandbox = running_sandbox(&fx).await;
    fx.manager.pause(sandbox.id).await.unwrap();
    // Second pause is a no-op success in the same terminal state.
    let again = fx.manager.pause(sandbox.id).await.unwrap();
    assert_eq!(again.status, SandboxStatus::Paused);
}

#[tokio::test]
async fn resume_restores_a_fresh_endpoint_and_touches_activity() {
    let fx = fixture().await;
    let sandbox = running_sandbox(&fx).await;
    let before = fx.manager.pause(sandbox.id).await.unwrap();
    assert!(before.endpoint.is_none());

    let resumed = fx.manager.resume(sandbox.id).await.unwrap();
    assert_eq!(resumed.status, SandboxStatus::Running);
    assert!(resumed.endpoint.is_some());
    assert!(resumed.paused_at.is_none());
    assert!(resumed.last_activity_at > sandbox.last_activity_at);
}

#[tokio::test]
async fn resume_from_running_is_an_illegal_transition() {
    let fx = fixture().await;
    let sandbox = running_sandbox(&fx).await;
    let err = fx.manager.resume(sandbox.id).await.unwrap_err();
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn pause_of_local_sandbox_is_rejected() {
    let fx = fixture().await;
    let (sandbox, _token) = fx
        .manager
        .create_local(fx.workspace_id, fx.user_id, "laptop")
        .await
        .unwrap();
    let err = fx.manager.pause(sandbox.id).await.unwrap_err();
    assert_eq!(err.http_status(), 400);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn delete_is_legal_from_every_state_and_idempotent() {
    let fx = fixture().await;

    // From running.
    let sandbox = running_sandbox(&fx).await;
    fx.manager.delete(sandbox.id).await.unwrap();
    assert!(fx.store.sandbox(sandbox.id).await.unwrap().is_none());
    assert!(!fx.backend.resource_exists(sandbox.id));
    // Repeated delete after success is still a success.
    fx.manager.delete(sandbox.id).await.unwrap();

    // From paused.
    let sandbox = running_sandbox(&fx).await;
    fx.manager.pause(sandbox.id).await.unwrap();
    fx.manager.delete(sandbox.id).await.unwrap();
    assert!(fx.store.sandbox(sandbox.id).await.unwrap().is_none());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tunnel attach / detach
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn local_sandbox_lifecycle_follows_the_tunnel() {
    let fx = fixture().await;
    let (sandbox, tunnel_token) = fx
        .manager
        .create_local(fx.workspace_id, fx.user_id, "laptop")
        .await
        .unwrap();
    assert!(!tunnel_token.is_empty());
    // Registered but never attached: still creating, endpoint always null.
    assert_eq!(sandbox.status, SandboxStatus::Creating);
    assert!(sandbox.endpoint.is_none());

    let attached = fx.manager.observe_tunnel_attach(sandbox.id).await.unwrap();
    assert_eq!(attached.status, SandboxStatus::Running);
    assert!(attached.last_heartbeat_at.is_some());
    assert!(attached.endpoint.is_none());

    fx.manager.observe_tunnel_detach(sandbox.id).await;
    let offline = fx.store.sandbox(sandbox.id).await.unwrap().unwrap();
    assert_eq!(offline.status, SandboxStatus::Offline);

    // Reconnect: offline -> running again.
    let reattached = fx.manager.observe_tunnel_attach(sandbox.id).await.unwrap();
    assert_eq!(reattached.status, SandboxStatus::Running);
}

#[tokio::test]
async fn tunnel_attach_is_rejected_while_deleting() {
    let fx = fixture().await;
    let (sandbox, _) = fx
        .manager
        .create_local(fx.workspace_id, fx.user_id, "laptop")
        .await
        .unwrap();
    let mut row = fx.store.sandbox(sandbox.id).await.unwrap().unwrap();
    row.status = SandboxStatus::Deleting;
    fx.store.put_sandbox(row);

    let err = fx.manager.observe_tunnel_attach(sandbox.id).await.unwrap_err();
    assert_eq!(err.http_status(), 409);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reaper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn age_activity(store: &MemStore, mut sandbox: Sandbox, secs: i64) -> Sandbox {
    sandbox.last_activity_at = Utc::now() - chrono::Duration::seconds(secs);
    store.put_sandbox(sandbox.clone());
    sandbox
}

#[tokio::test]
async fn reaper_pauses_idle_cloud_sandboxes() {
    let fx = fixture().await;
    let sandbox = running_sandbox(&fx).await;
    // Idle for twice the 30s workspace default.
    age_activity(&fx.store, sandbox.clone(), 60);

    reaper::tick(&fx.manager).await;
    wait_for_status(&fx.store, sandbox.id, SandboxStatus::Paused).await;
}

#[tokio::test]
async fn reaper_skips_sandboxes_whose_activity_advanced() {
    let fx = fixture().await;
    let sandbox = running_sandbox(&fx).await;
    age_activity(&fx.store, sandbox.clone(), 60);

    // Activity lands between evaluation and the worker acquiring the lock;
    // the re-check must keep the sandbox running.
    fx.store.touch_activity(sandbox.id).await.unwrap();
    fx.manager.pause_if_still_idle(sandbox.id).await.unwrap();

    let current = fx.store.sandbox(sandbox.id).await.unwrap().unwrap();
    assert_eq!(current.status, SandboxStatus::Running);
}

#[tokio::test]
async fn reaper_marks_stale_local_sandboxes_offline() {
    let fx = fixture().await;
    let (sandbox, _) = fx
        .manager
        .create_local(fx.workspace_id, fx.user_id, "laptop")
        .await
        .unwrap();
    fx.manager.observe_tunnel_attach(sandbox.id).await.unwrap();

    let mut row = fx.store.sandbox(sandbox.id).await.unwrap().unwrap();
    row.last_heartbeat_at = Some(Utc::now() - chrono::Duration::seconds(300));
    fx.store.put_sandbox(row);

    reaper::tick(&fx.manager).await;
    wait_for_status(&fx.store, sandbox.id, SandboxStatus::Offline).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconciliation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn orphaned_backend_resources_are_destroyed() {
    let fx = fixture().await;
    let ghost = Uuid::new_v4();
    fx.backend.seed_resource(ghost, ObservedStatus::Ready { endpoint: "10.9.9.9:8080".into() });

    reconcile::run(&fx.manager).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!fx.backend.resource_exists(ghost));
}

#[tokio::test]
async fn interrupted_pause_converges_to_paused() {
    let fx = fixture().await;
    let sandbox = running_sandbox(&fx).await;

    // Crash mid-pause: row says pausing, backend already stopped.
    fx.backend.pause(sandbox.id).await.unwrap();
    let mut row = fx.store.sandbox(sandbox.id).await.unwrap().unwrap();
    row.status = SandboxStatus::Pausing;
    fx.store.put_sandbox(row);

    reconcile::run(&fx.manager).await;
    let converged = wait_for_status(&fx.store, sandbox.id, SandboxStatus::Paused).await;
    assert!(converged.endpoint.is_none());
}

#[tokio::test]
async fn interrupted_resume_converges_to_running() {
    let fx = fixture().await;
    let sandbox = running_sandbox(&fx).await;
    fx.manager.pause(sandbox.id).await.unwrap();

    // Crash mid-resume: row says resuming, backend still stopped.
    let mut row = fx.store.sandbox(sandbox.id).await.unwrap().unwrap();
    row.status = SandboxStatus::Resuming;
    fx.store.put_sandbox(row);

    reconcile::run(&fx.manager).await;
    let converged = wait_for_status(&fx.store, sandbox.id, SandboxStatus::Running).await;
    assert!(converged.endpoint.is_some());
}

#[tokio::test]
async fn interrupted_delete_converges_to_removed() {
    let fx = fixture().await;
    let sandbox = running_sandbox(&fx).await;
    let mut row = fx.store.sandbox(sandbox.id).await.unwrap().unwrap();
    row.status = SandboxStatus::Deleting;
    fx.store.put_sandbox(row);

    reconcile::run(&fx.manager).await;
    wait_for_removal(&fx.store, sandbox.id).await;
    assert!(!fx.backend.resource_exists(sandbox.id));
}

#[tokio::test]
async fn interrupted_create_is_driven_to_running() {
    let fx = fixture().await;
    // A creating row with no backend resource at all (crash before the
    // provision call landed).
    let sandbox = fx
        .manager
        .clone()
        .create_cloud(fx.workspace_id, fx.user_id, create_request("dev"))
        .await
        .unwrap();
    let running = wait_for_status(&fx.store, sandbox.id, SandboxStatus::Running).await;

    // Forge the crash: reset to creating and wipe the backend resource.
    fx.backend.destroy(sandbox.id).await.unwrap();
    let mut row = running.clone();
    row.status = SandboxStatus::Creating;
    row.endpoint = None;
    fx.store.put_sandbox(row);

    reconcile::run(&fx.manager).await;
    let converged = wait_for_status(&fx.store, sandbox.id, SandboxStatus::Running).await;
    assert!(converged.endpoint.is_some());
    assert!(fx.backend.resource_exists(sandbox.id));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transient failures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn transient_provision_failure_retries_to_success() {
    let fx = fixture().await;
    fx.backend.fail_next_provision_transient();
    let sandbox = fx
        .manager
        .clone()
        .create_cloud(fx.workspace_id, fx.user_id, create_request("flaky"))
        .await
        .unwrap();
    // First attempt fails, the backoff retry succeeds.
    let running = wait_for_status(&fx.store, sandbox.id, SandboxStatus::Running).await;
    assert!(running.endpoint.is_some());
    let calls = fx.backend.calls();
    let provisions = calls.iter().filter(|c| c.starts_with("provision")).count();
    assert_eq!(provisions, 2);
}
