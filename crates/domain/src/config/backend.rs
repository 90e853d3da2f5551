use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Container backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which container backend drives cloud sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Docker,
    Kubernetes,
}

impl BackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "docker" => Some(BackendKind::Docker),
            "kubernetes" | "k8s" => Some(BackendKind::Kubernetes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "d_kind")]
    pub kind: BackendKind,
    /// Image every sandbox runs; the agent HTTP server listens on
    /// `agent_port` inside it.
    #[serde(default)]
    pub agent_image: String,
    #[serde(default = "d_agent_port")]
    pub agent_port: u16,
    /// Kubernetes namespace sandboxes are created in.
    #[serde(default = "d_namespace")]
    pub sandbox_namespace: String,
    /// Optional runtime class for the pod (e.g. a sandboxing kernel).
    #[serde(default)]
    pub runtime_class: Option<String>,
    /// Storage class for per-workspace drives and per-sandbox claims.
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Default per-sandbox ephemeral claim size.
    #[serde(default = "d_claim_bytes")]
    pub sandbox_claim_bytes: i64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: d_kind(),
            agent_image: String::new(),
            agent_port: d_agent_port(),
            sandbox_namespace: d_namespace(),
            runtime_class: None,
            storage_class: None,
            sandbox_claim_bytes: d_claim_bytes(),
        }
    }
}

fn d_kind() -> BackendKind {
    BackendKind::Docker
}
fn d_agent_port() -> u16 {
    8080
}
fn d_namespace() -> String {
    "drydock".into()
}
fn d_claim_bytes() -> i64 {
    10 * 1024 * 1024 * 1024
}
