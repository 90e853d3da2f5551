//! Single-host Docker backend.
//!
//! Provision creates one container per sandbox with hard resource limits and
//! a hardened security profile (all capabilities dropped,
//! `no-new-privileges`), mounts the workspace drive at `/workspace`, and
//! waits for the runtime "running" state plus a TCP probe of the agent port.
//! Pause stops the container preserving its volumes; resume starts it again;
//! destroy force-removes it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use dd_domain::config::{BackendConfig, LimitsConfig};
use dd_domain::{Error, Result};
use uuid::Uuid;

use crate::{
    drive_name, resource_name, ObservedStatus, ProvisionSpec, SandboxBackend, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE, SANDBOX_ID_LABEL,
};

pub struct DockerBackend {
    docker: Docker,
    config: BackendConfig,
    limits: LimitsConfig,
}

impl DockerBackend {
    /// Connect to the local Docker daemon. Failure here is a startup error.
    pub fn new(config: BackendConfig, limits: LimitsConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::BackendFatal(format!("docker connect: {e}")))?;
        Ok(Self { docker, config, limits })
    }

    fn labels(sandbox_id: Uuid) -> HashMap<String, String> {
        HashMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (SANDBOX_ID_LABEL.to_string(), sandbox_id.to_string()),
        ])
    }

    /// Container IP on its first attached network.
    async fn container_ip(&self, name: &str) -> Result<Option<String>> {
        let inspect = self
            .docker
            .inspect_container(name, None)
            .await
            .map_err(|e| map_err("inspect", e))?;
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Ok(None);
        }
        let ip = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .and_then(|nets| nets.values().find_map(|n| n.ip_address.clone()))
            .filter(|ip| !ip.is_empty());
        Ok(ip)
    }

    /// Wait until the container runs and its agent port accepts TCP.
    async fn wait_ready(&self, name: &str) -> Result<String> {
        let cadence = Duration::from_secs(self.limits.readiness_poll_secs.max(1));
        let budget = Duration::from_secs(self.limits.readiness_budget_secs);
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            if let Some(ip) = self.container_ip(name).await? {
                let endpoint = format!("{}:{}", ip, self.config.agent_port);
                if tcp_probe(&endpoint, cadence).await {
                    return Ok(endpoint);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::BackendTransient(format!(
                    "container {name} not ready within {}s",
                    budget.as_secs()
                )));
            }
            tokio::time::sleep(cadence).await;
        }
    }
}

/// TCP connect with a bounded timeout.
async fn tcp_probe(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

fn map_err(op: &str, e: bollard::errors::Error) -> Error {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, message } => {
            if status_code >= 500 {
                Error::BackendTransient(format!("docker {op}: {status_code} {message}"))
            } else {
                Error::BackendFatal(format!("docker {op}: {status_code} {message}"))
            }
        }
        other => Error::BackendTransient(format!("docker {op}: {other}")),
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn provision(&self, spec: &ProvisionSpec) -> Result<String> {
        let name = resource_name(spec.sandbox_id);
        let drive = drive_name(spec.workspace_id);

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.cpu_millicores * 1_000_000),
            pids_limit: Some(512),
            cap_drop: Some(vec!["ALL".into()]),
            security_opt: Some(vec!["no-new-privileges:true".into()]),
            mounts: Some(vec![Mount {
                target: Some("/workspace".into()),
                source: Some(drive),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let container = Config {
            image: Some(self.config.agent_image.clone()),
            env: Some(vec![
                format!("DRYDOCK_SANDBOX_TOKEN={}", spec.sandbox_token),
                format!("DRYDOCK_PROXY_URL={}", spec.proxy_url),
                format!("DRYDOCK_PROXY_TOKEN={}", spec.proxy_token),
                format!("AGENT_PORT={}", self.config.agent_port),
            ]),
            labels: Some(Self::labels(spec.sandbox_id)),
            host_config: Some(host_config),
            ..Default::default()
        };

        tracing::info!(sandbox_id = %spec.sandbox_id, container = %name, "creating container");
        self.docker
            .create_container(
                Some(CreateContainerOptions { name: name.clone(), platform: None }),
                container,
            )
            .await
            .map_err(|e| map_err("create", e))?;

        // After creation succeeds, any failure must clean the container up.
        let result = async {
            self.docker
                .start_container(&name, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| map_err("start", e))?;
            self.wait_ready(&name).await
        }
        .await;

        if result.is_err() {
            if let Err(e) = self
                .docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions { force: true, ..Default::default() }),
                )
                .await
            {
                tracing::warn!(container = %name, error = %e, "cleanup after failed provision");
            }
        }
        result
    }

    async fn pause(&self, sandbox_id: Uuid) -> Result<()> {
        let name = resource_name(sandbox_id);
        match self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped is a success for our purposes.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err("stop", e)),
        }
    }

    async fn resume(&self, sandbox_id: Uuid) -> Result<String> {
        let name = resource_name(sandbox_id);
        match self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(map_err("start", e)),
        }
        self.wait_ready(&name).await
    }

    async fn destroy(&self, sandbox_id: Uuid) -> Result<()> {
        let name = resource_name(sandbox_id);
        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_err("remove", e)),
        }
    }

    async fn list_owned(&self) -> Result<Vec<Uuid>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_err("list", e))?;

        let mut owned = Vec::new();
        for container in containers {
            let id = container
                .labels
                .as_ref()
                .and_then(|l| l.get(SANDBOX_ID_LABEL))
                .and_then(|v| v.parse().ok());
            if let Some(id) = id {
                owned.push(id);
            }
        }
        Ok(owned)
    }

    async fn observed_status(&self, sandbox_id: Uuid) -> Result<ObservedStatus> {
        let name = resource_name(sandbox_id);
        match self.docker.inspect_container(&name, None).await {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                if !running {
                    return Ok(ObservedStatus::Stopped);
                }
                match self.container_ip(&name).await? {
                    Some(ip) => Ok(ObservedStatus::Ready {
                        endpoint: format!("{}:{}", ip, self.config.agent_port),
                    }),
                    None => Ok(ObservedStatus::Stopped),
                }
            }
            Err(e) if is_not_found(&e) => Ok(ObservedStatus::Absent),
            Err(e) => Err(map_err("inspect", e)),
        }
    }

    async fn ensure_workspace_drive(
        &self,
        workspace_id: Uuid,
        _size_bytes: i64,
    ) -> Result<String> {
        // Docker named volumes have no size parameter; the quota is enforced
        // at create time against the drive ceiling instead.
        let name = drive_name(workspace_id);
        let labels = HashMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )]);
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.clone(),
                labels,
                ..Default::default()
            })
            .await
            .map_err(|e| map_err("create volume", e))?;
        Ok(name)
    }

    async fn destroy_workspace_drive(&self, workspace_id: Uuid) -> Result<()> {
        let name = drive_name(workspace_id);
        match self.docker.remove_volume(&name, None).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_err("remove volume", e)),
        }
    }
}
