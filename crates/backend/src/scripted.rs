//! Scripted in-memory backend for lifecycle tests.
//!
//! Tracks resource state per sandbox and lets tests inject failures for the
//! next provision/pause/resume call.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dd_domain::{Error, Result};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{ObservedStatus, ProvisionSpec, SandboxBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scripted {
    FailTransient,
    FailFatal,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<Uuid, ObservedStatus>,
    drives: HashSet<Uuid>,
    next_provision: Option<Scripted>,
    next_resume: Option<Scripted>,
    counter: u8,
    /// Operation log, oldest first: "provision <id>", "pause <id>", …
    calls: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedBackend {
    inner: Mutex<Inner>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_provision_transient(&self) {
        self.inner.lock().next_provision = Some(Scripted::FailTransient);
    }

    pub fn fail_next_provision_fatal(&self) {
        self.inner.lock().next_provision = Some(Scripted::FailFatal);
    }

    pub fn fail_next_resume_transient(&self) {
        self.inner.lock().next_resume = Some(Scripted::FailTransient);
    }

    /// Pre-seed a resource the store knows nothing about (orphan tests).
    pub fn seed_resource(&self, id: Uuid, status: ObservedStatus) {
        self.inner.lock().resources.insert(id, status);
    }

    pub fn resource_exists(&self, id: Uuid) -> bool {
        self.inner.lock().resources.contains_key(&id)
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    fn next_endpoint(inner: &mut Inner) -> String {
        inner.counter = inner.counter.wrapping_add(1);
        format!("10.0.0.{}:8080", inner.counter)
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    async fn provision(&self, spec: &ProvisionSpec) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("provision {}", spec.sandbox_id));
        match inner.next_provision.take() {
            Some(Scripted::FailTransient) => {
                return Err(Error::BackendTransient("scripted provision failure".into()))
            }
            Some(Scripted::FailFatal) => {
                return Err(Error::BackendFatal("scripted provision failure".into()))
            }
            None => {}
        }
        let endpoint = Self::next_endpoint(&mut inner);
        inner
            .resources
            .insert(spec.sandbox_id, ObservedStatus::Ready { endpoint: endpoint.clone() });
        Ok(endpoint)
    }

    async fn pause(&self, sandbox_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("pause {sandbox_id}"));
        match inner.resources.get_mut(&sandbox_id) {
            Some(state) => {
                *state = ObservedStatus::Stopped;
                Ok(())
            }
            None => Err(Error::BackendFatal(format!("no resource for {sandbox_id}"))),
        }
    }

    async fn resume(&self, sandbox_id: Uuid) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("resume {sandbox_id}"));
        if let Some(Scripted::FailTransient) = inner.next_resume.take() {
            return Err(Error::BackendTransient("scripted resume failure".into()));
        }
        if !inner.resources.contains_key(&sandbox_id) {
            return Err(Error::BackendFatal(format!("no resource for {sandbox_id}")));
        }
        let endpoint = Self::next_endpoint(&mut inner);
        inner
            .resources
            .insert(sandbox_id, ObservedStatus::Ready { endpoint: endpoint.clone() });
        Ok(endpoint)
    }

    async fn destroy(&self, sandbox_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("destroy {sandbox_id}"));
        inner.resources.remove(&sandbox_id);
        Ok(())
    }

    async fn list_owned(&self) -> Result<Vec<Uuid>> {
        Ok(self.inner.lock().resources.keys().copied().collect())
    }

    async fn observed_status(&self, sandbox_id: Uuid) -> Result<ObservedStatus> {
        Ok(self
            .inner
            .lock()
            .resources
            .get(&sandbox_id)
            .cloned()
            .unwrap_or(ObservedStatus::Absent))
    }

    async fn ensure_workspace_drive(
        &self,
        workspace_id: Uuid,
        _size_bytes: i64,
    ) -> Result<String> {
        self.inner.lock().drives.insert(workspace_id);
        Ok(crate::drive_name(workspace_id))
    }

    async fn destroy_workspace_drive(&self, workspace_id: Uuid) -> Result<()> {
        self.inner.lock().drives.remove(&workspace_id);
        Ok(())
    }
}
