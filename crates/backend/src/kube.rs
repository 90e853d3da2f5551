//! Kubernetes backend.
//!
//! Each sandbox is one `Sandbox` custom resource; an in-cluster controller
//! (shipped with the Helm chart) materializes it into a pod plus a
//! per-sandbox ephemeral claim and garbage-collects both when the resource
//! is deleted. This backend creates and patches the resources and watches
//! their readiness condition; pause is `spec.replicas = 0`, resume patches
//! back to 1.
//!
//! The first time a claim is used, an init container seeds it from the
//! image's home directory and fixes ownership; a sentinel file makes the
//! seeding run exactly once so resumes never overwrite user data.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dd_domain::config::{BackendConfig, LimitsConfig};
use dd_domain::{Error, Result};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    drive_name, resource_name, ObservedStatus, ProvisionSpec, SandboxBackend, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE, SANDBOX_ID_LABEL,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Custom resource
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Home directory baked into the agent image; the claim is seeded from it.
const IMAGE_HOME: &str = "/home/agent";
/// Sentinel marking an already-seeded claim.
const SEED_SENTINEL: &str = ".drydock-seeded";

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "drydock.dev",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    shortname = "sbx",
    status = "SandboxCrStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    /// 1 = running, 0 = paused. The controller scales the pod accordingly.
    pub replicas: i32,
    pub image: String,
    pub agent_port: u16,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    /// Per-sandbox ephemeral claim, templated by the controller.
    pub claim_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Shared workspace drive (a pre-provisioned PVC), mounted read-write
    /// at /workspace.
    pub workspace_claim: String,
    /// Shell command the init container runs against the fresh claim.
    pub init_command: String,
    /// Environment for the agent container.
    pub env: Vec<EnvPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_class: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct EnvPair {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxCrStatus {
    #[serde(default)]
    pub conditions: Vec<SandboxCondition>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SandboxCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" / "False" / "Unknown", matching core condition conventions.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn is_ready(status: Option<&SandboxCrStatus>) -> bool {
    status
        .map(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// The idempotent seed command: copy the image home into the claim once,
/// fix ownership, then drop the sentinel.
fn seed_command() -> String {
    format!(
        "if [ ! -f /workspace-home/{SEED_SENTINEL} ]; then \
         cp -a {IMAGE_HOME}/. /workspace-home/ && \
         chown -R 1000:1000 /workspace-home && \
         touch /workspace-home/{SEED_SENTINEL}; fi"
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct KubeBackend {
    client: Client,
    config: BackendConfig,
    limits: LimitsConfig,
}

impl KubeBackend {
    /// Build a client from the ambient kubeconfig / in-cluster env.
    pub async fn new(config: BackendConfig, limits: LimitsConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::BackendFatal(format!("kube client: {e}")))?;
        Ok(Self { client, config, limits })
    }

    fn sandboxes(&self) -> Api<Sandbox> {
        Api::namespaced(self.client.clone(), &self.config.sandbox_namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.sandbox_namespace)
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.config.sandbox_namespace)
    }

    fn labels(sandbox_id: Uuid) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (SANDBOX_ID_LABEL.to_string(), sandbox_id.to_string()),
        ])
    }

    fn build_resource(&self, spec: &ProvisionSpec) -> Sandbox {
        let mut sandbox = Sandbox::new(
            &resource_name(spec.sandbox_id),
            SandboxSpec {
                replicas: 1,
                image: self.config.agent_image.clone(),
                agent_port: self.config.agent_port,
                cpu_millicores: spec.cpu_millicores,
                memory_bytes: spec.memory_bytes,
                claim_bytes: self.config.sandbox_claim_bytes,
                storage_class: self.config.storage_class.clone(),
                workspace_claim: drive_name(spec.workspace_id),
                init_command: seed_command(),
                env: vec![
                    EnvPair {
                        name: "DRYDOCK_SANDBOX_TOKEN".into(),
                        value: spec.sandbox_token.clone(),
                    },
                    EnvPair {
                        name: "DRYDOCK_PROXY_URL".into(),
                        value: spec.proxy_url.clone(),
                    },
                    EnvPair {
                        name: "DRYDOCK_PROXY_TOKEN".into(),
                        value: spec.proxy_token.clone(),
                    },
                ],
                runtime_class: self.config.runtime_class.clone(),
            },
        );
        sandbox.metadata.labels = Some(Self::labels(spec.sandbox_id));
        sandbox
    }

    /// Pod IP of the sandbox's pod, once one is scheduled and addressable.
    async fn pod_ip(&self, sandbox_id: Uuid) -> Result<Option<String>> {
        let selector = format!("{SANDBOX_ID_LABEL}={sandbox_id}");
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| map_err("list pods", e))?;
        Ok(pods
            .items
            .into_iter()
            .find_map(|p| p.status.and_then(|s| s.pod_ip))
            .filter(|ip| !ip.is_empty()))
    }

    /// Poll the resource's Ready condition, then read the pod IP.
    async fn wait_ready(&self, sandbox_id: Uuid) -> Result<String> {
        let name = resource_name(sandbox_id);
        let cadence =
            std::time::Duration::from_secs(self.limits.readiness_poll_secs.max(1));
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(self.limits.readiness_budget_secs);

        loop {
            let current = self
                .sandboxes()
                .get_opt(&name)
                .await
                .map_err(|e| map_err("get", e))?;
            if let Some(cr) = current {
                if is_ready(cr.status.as_ref()) {
                    if let Some(ip) = self.pod_ip(sandbox_id).await? {
                        return Ok(format!("{}:{}", ip, self.config.agent_port));
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::BackendTransient(format!(
                    "sandbox {name} not ready within {}s",
                    self.limits.readiness_budget_secs
                )));
            }
            tokio::time::sleep(cadence).await;
        }
    }

    async fn patch_replicas(&self, sandbox_id: Uuid, replicas: i32) -> Result<()> {
        let name = resource_name(sandbox_id);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.sandboxes()
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err("patch", e))?;
        Ok(())
    }
}

fn map_err(op: &str, e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(ae) if ae.code >= 500 => {
            Error::BackendTransient(format!("kube {op}: {e}"))
        }
        kube::Error::Api(_) => Error::BackendFatal(format!("kube {op}: {e}")),
        _ => Error::BackendTransient(format!("kube {op}: {e}")),
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl SandboxBackend for KubeBackend {
    async fn provision(&self, spec: &ProvisionSpec) -> Result<String> {
        let resource = self.build_resource(spec);
        let name = resource_name(spec.sandbox_id);
        tracing::info!(
            sandbox_id = %spec.sandbox_id,
            resource = %name,
            namespace = %self.config.sandbox_namespace,
            "creating Sandbox resource"
        );
        self.sandboxes()
            .create(&PostParams::default(), &resource)
            .await
            .map_err(|e| map_err("create", e))?;

        // After creation succeeds, any failure must clean the resource up.
        let result = self.wait_ready(spec.sandbox_id).await;
        if result.is_err() {
            if let Err(del) = self.destroy(spec.sandbox_id).await {
                tracing::warn!(resource = %name, error = %del, "cleanup after failed provision");
            }
        }
        result
    }

    async fn pause(&self, sandbox_id: Uuid) -> Result<()> {
        self.patch_replicas(sandbox_id, 0).await?;
        // Wait for the pod to actually go away so the stored endpoint is
        // never cleared while traffic could still land on it.
        let cadence =
            std::time::Duration::from_secs(self.limits.readiness_poll_secs.max(1));
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(self.limits.readiness_budget_secs);
        while self.pod_ip(sandbox_id).await?.is_some() {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::BackendTransient(format!(
                    "sandbox {sandbox_id} pod still present after scale-to-0"
                )));
            }
            tokio::time::sleep(cadence).await;
        }
        Ok(())
    }

    async fn resume(&self, sandbox_id: Uuid) -> Result<String> {
        self.patch_replicas(sandbox_id, 1).await?;
        self.wait_ready(sandbox_id).await
    }

    async fn destroy(&self, sandbox_id: Uuid) -> Result<()> {
        let name = resource_name(sandbox_id);
        match self.sandboxes().delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_err("delete", e)),
        }
    }

    async fn list_owned(&self) -> Result<Vec<Uuid>> {
        let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
        let list = self
            .sandboxes()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| map_err("list", e))?;
        Ok(list
            .items
            .iter()
            .filter_map(|cr| {
                cr.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(SANDBOX_ID_LABEL))
                    .and_then(|v| v.parse().ok())
            })
            .collect())
    }

    async fn observed_status(&self, sandbox_id: Uuid) -> Result<ObservedStatus> {
        let name = resource_name(sandbox_id);
        let cr = self
            .sandboxes()
            .get_opt(&name)
            .await
            .map_err(|e| map_err("get", e))?;
        let Some(cr) = cr else {
            return Ok(ObservedStatus::Absent);
        };
        if cr.spec.replicas == 0 {
            return Ok(ObservedStatus::Stopped);
        }
        if is_ready(cr.status.as_ref()) {
            if let Some(ip) = self.pod_ip(sandbox_id).await? {
                return Ok(ObservedStatus::Ready {
                    endpoint: format!("{}:{}", ip, self.config.agent_port),
                });
            }
        }
        Ok(ObservedStatus::Stopped)
    }

    async fn ensure_workspace_drive(
        &self,
        workspace_id: Uuid,
        size_bytes: i64,
    ) -> Result<String> {
        let name = drive_name(workspace_id);
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    MANAGED_BY_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".into()]),
                storage_class_name: self.config.storage_class.clone(),
                resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(size_bytes.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        match self.claims().create(&PostParams::default(), &claim).await {
            Ok(_) => Ok(name),
            // Already provisioned by an earlier create in this workspace.
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(name),
            Err(e) => Err(map_err("create pvc", e)),
        }
    }

    async fn destroy_workspace_drive(&self, workspace_id: Uuid) -> Result<()> {
        let name = drive_name(workspace_id);
        match self.claims().delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_err("delete pvc", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_command_is_sentinel_guarded() {
        let cmd = seed_command();
        assert!(cmd.starts_with("if [ ! -f /workspace-home/.drydock-seeded ]"));
        assert!(cmd.contains("cp -a /home/agent/."));
        assert!(cmd.contains("chown -R"));
        assert!(cmd.contains("touch /workspace-home/.drydock-seeded"));
    }

    #[test]
    fn ready_condition_detection() {
        assert!(!is_ready(None));
        let mut status = SandboxCrStatus::default();
        assert!(!is_ready(Some(&status)));
        status.conditions.push(SandboxCondition {
            type_: "Ready".into(),
            status: "False".into(),
            reason: None,
        });
        assert!(!is_ready(Some(&status)));
        status.conditions.push(SandboxCondition {
            type_: "Ready".into(),
            status: "True".into(),
            reason: None,
        });
        assert!(is_ready(Some(&status)));
    }
}
