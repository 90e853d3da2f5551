//! Row types returned by the store.

use chrono::{DateTime, Duration, Utc};
use dd_domain::{Role, SandboxKind, SandboxStatus};
use serde::Serialize;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Users & workspaces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceMember {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceVolume {
    pub workspace_id: Uuid,
    pub volume_name: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandboxes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A sandbox row. Secrets stay server-side; API responses use
/// [`SandboxView`] in the gateway instead of serializing this directly.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: Uuid,
    pub short_id: String,
    pub workspace_id: Uuid,
    pub name: String,
    pub kind: SandboxKind,
    pub status: SandboxStatus,
    /// `host:port` of the agent server; set exactly while a cloud sandbox
    /// is running. Always `None` for local sandboxes (tunnel-routed).
    pub endpoint: Option<String>,
    pub proxy_token: String,
    pub sandbox_token: String,
    /// Local kind only; rotatable.
    pub tunnel_token: Option<String>,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    /// `None` means "use the workspace default".
    pub idle_timeout_secs: Option<i64>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
}

impl Sandbox {
    /// Idle timeout for this sandbox, falling back to the workspace default.
    pub fn effective_idle_timeout_secs(&self, default_secs: i64) -> i64 {
        self.idle_timeout_secs.unwrap_or(default_secs)
    }

    /// Whether the reaper should pause this sandbox now.
    pub fn is_idle(&self, now: DateTime<Utc>, default_secs: i64) -> bool {
        let timeout = self.effective_idle_timeout_secs(default_secs);
        now - self.last_activity_at >= Duration::seconds(timeout)
    }

    /// Whether the local-kind heartbeat has gone stale.
    pub fn heartbeat_stale(&self, now: DateTime<Utc>, timeout_secs: i64) -> bool {
        match self.last_heartbeat_at {
            Some(beat) => now - beat >= Duration::seconds(timeout_secs),
            // Never seen a heartbeat: measure from creation.
            None => now - self.created_at >= Duration::seconds(timeout_secs),
        }
    }
}

/// Inputs for inserting a sandbox row. IDs and tokens are generated by the
/// lifecycle manager before insert so failures stay visible to the caller.
#[derive(Debug, Clone)]
pub struct NewSandbox {
    pub id: Uuid,
    pub short_id: String,
    pub workspace_id: Uuid,
    pub name: String,
    pub kind: SandboxKind,
    pub proxy_token: String,
    pub sandbox_token: String,
    pub tunnel_token: Option<String>,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    pub idle_timeout_secs: Option<i64>,
    pub created_by: Uuid,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The (workspace, user) binding a redeemed registration code yields.
#[derive(Debug, Clone, Copy)]
pub struct CodeBinding {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sandbox(last_activity: DateTime<Utc>) -> Sandbox {
        Sandbox {
            id: Uuid::new_v4(),
            short_id: "abcdef0123456789".into(),
            workspace_id: Uuid::new_v4(),
            name: "dev".into(),
            kind: SandboxKind::Cloud,
            status: SandboxStatus::Running,
            endpoint: Some("10.0.0.5:8080".into()),
            proxy_token: "p".into(),
            sandbox_token: "s".into(),
            tunnel_token: None,
            cpu_millicores: 1000,
            memory_bytes: 1 << 30,
            idle_timeout_secs: None,
            created_by: Uuid::new_v4(),
            created_at: last_activity,
            last_activity_at: last_activity,
            last_heartbeat_at: None,
            paused_at: None,
        }
    }

    #[test]
    fn idle_uses_workspace_default_when_unset() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let sb = sandbox(t0);
        assert!(!sb.is_idle(t0 + Duration::seconds(29), 30));
        assert!(sb.is_idle(t0 + Duration::seconds(30), 30));
    }

    #[test]
    fn idle_prefers_row_override() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut sb = sandbox(t0);
        sb.idle_timeout_secs = Some(10);
        assert!(sb.is_idle(t0 + Duration::seconds(10), 3600));
    }

    #[test]
    fn heartbeat_staleness_falls_back_to_creation() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut sb = sandbox(t0);
        assert!(sb.heartbeat_stale(t0 + Duration::seconds(90), 90));
        sb.last_heartbeat_at = Some(t0 + Duration::seconds(60));
        assert!(!sb.heartbeat_stale(t0 + Duration::seconds(90), 90));
        assert!(sb.heartbeat_stale(t0 + Duration::seconds(150), 90));
    }
}
