//! Container backends for cloud sandboxes.
//!
//! The lifecycle manager depends only on [`SandboxBackend`]; the Docker and
//! Kubernetes implementations each cover that surface and nothing more.
//! Resources a backend creates carry the `managed-by=drydock` label plus the
//! sandbox id, so orphan sweeps and reconciliation can cross-reference the
//! store without guessing.

pub mod docker;
pub mod kube;

#[cfg(any(test, feature = "test-support"))]
pub mod scripted;

use async_trait::async_trait;
use dd_domain::Result;
use uuid::Uuid;

/// Label every managed resource carries.
pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "drydock";
/// Label holding the owning sandbox id.
pub const SANDBOX_ID_LABEL: &str = "drydock.sandbox-id";

/// Resource name for a sandbox (container or custom resource).
pub fn resource_name(sandbox_id: Uuid) -> String {
    format!("dd-{sandbox_id}")
}

/// Parse a sandbox id back out of a resource name.
pub fn sandbox_id_from_name(name: &str) -> Option<Uuid> {
    name.strip_prefix("dd-")?.parse().ok()
}

/// Name of a workspace's shared drive (volume or PVC).
pub fn drive_name(workspace_id: Uuid) -> String {
    format!("dd-ws-{workspace_id}")
}

/// Inputs the backends need to provision one sandbox.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub sandbox_id: Uuid,
    pub workspace_id: Uuid,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    /// Credential the in-sandbox agent server asserts on inbound requests.
    pub sandbox_token: String,
    /// URL of the control plane's upstream API proxy, injected so the
    /// sandbox never needs the real operator credential.
    pub proxy_url: String,
    /// Bearer credential for the upstream API proxy.
    pub proxy_token: String,
}

/// What the backend can observe about a sandbox's resource, used by
/// post-crash reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedStatus {
    /// Resource exists and serves traffic at this `host:port`.
    Ready { endpoint: String },
    /// Resource exists but is stopped / scaled to zero.
    Stopped,
    /// No such resource.
    Absent,
}

/// The narrow surface the lifecycle manager drives.
#[async_trait]
pub trait SandboxBackend: Send + Sync + 'static {
    /// Create the sandbox's resource and wait for readiness.
    /// Returns the `host:port` endpoint of the agent server.
    async fn provision(&self, spec: &ProvisionSpec) -> Result<String>;

    /// Stop the sandbox, preserving its storage.
    async fn pause(&self, sandbox_id: Uuid) -> Result<()>;

    /// Start a paused sandbox and wait for readiness. Returns the fresh
    /// endpoint (may differ from the pre-pause one).
    async fn resume(&self, sandbox_id: Uuid) -> Result<String>;

    /// Tear the resource down. Idempotent: destroying an absent resource
    /// succeeds.
    async fn destroy(&self, sandbox_id: Uuid) -> Result<()>;

    /// Sandbox ids of every resource tagged `managed-by=drydock`.
    async fn list_owned(&self) -> Result<Vec<Uuid>>;

    /// Current observed state of one sandbox's resource.
    async fn observed_status(&self, sandbox_id: Uuid) -> Result<ObservedStatus>;

    /// Ensure the workspace's shared drive exists; returns its name.
    async fn ensure_workspace_drive(&self, workspace_id: Uuid, size_bytes: i64)
        -> Result<String>;

    /// Remove the workspace drive (workspace delete cascade).
    async fn destroy_workspace_drive(&self, workspace_id: Uuid) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_round_trip() {
        let id = Uuid::new_v4();
        let name = resource_name(id);
        assert!(name.starts_with("dd-"));
        assert_eq!(sandbox_id_from_name(&name), Some(id));
        assert_eq!(sandbox_id_from_name("unrelated"), None);
        assert_eq!(sandbox_id_from_name("dd-not-a-uuid"), None);
    }

    #[test]
    fn drive_names_are_workspace_scoped() {
        let ws = Uuid::new_v4();
        assert_eq!(drive_name(ws), format!("dd-ws-{ws}"));
    }
}
