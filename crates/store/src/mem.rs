//! In-memory [`Store`] for tests.
//!
//! Mirrors the Postgres semantics the control loops rely on: compare-and-
//! swap status updates, case-insensitive short-ID uniqueness, single-use
//! code redemption, and cascade on workspace delete.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dd_domain::quota::{QuotaLimits, QuotaUsage};
use dd_domain::{Error, Result, Role, SandboxStatus};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::{
    CodeBinding, NewSandbox, Sandbox, User, Workspace, WorkspaceMember, WorkspaceVolume,
};
use crate::{EndpointChange, Store};

#[derive(Clone)]
struct CodeRow {
    workspace_id: Uuid,
    user_id: Uuid,
    expires_at: DateTime<Utc>,
    redeemed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    sessions: HashMap<String, Uuid>,
    workspaces: HashMap<Uuid, Workspace>,
    members: HashMap<(Uuid, Uuid), (Role, DateTime<Utc>)>,
    volumes: HashMap<Uuid, WorkspaceVolume>,
    sandboxes: HashMap<Uuid, Sandbox>,
    codes: HashMap<String, CodeRow>,
    workspace_quotas: HashMap<Uuid, QuotaLimits>,
    user_quotas: HashMap<Uuid, QuotaLimits>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user and return its id.
    pub fn add_user(&self, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().users.insert(
            id,
            User {
                id,
                email: email.into(),
                display_name: None,
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Seed a session cookie digest for a user.
    pub fn add_session(&self, digest: &str, user_id: Uuid) {
        self.inner.lock().sessions.insert(digest.into(), user_id);
    }

    pub fn set_workspace_quota(&self, workspace_id: Uuid, limits: QuotaLimits) {
        self.inner.lock().workspace_quotas.insert(workspace_id, limits);
    }

    /// Test hook: overwrite a sandbox row wholesale.
    pub fn put_sandbox(&self, sandbox: Sandbox) {
        self.inner.lock().sandboxes.insert(sandbox.id, sandbox);
    }
}

#[async_trait]
impl Store for MemStore {
    async fn user_by_session_digest(&self, digest: &str) -> Result<Option<User>> {
        let inner = self.inner.lock();
        Ok(inner
            .sessions
            .get(digest)
            .and_then(|uid| inner.users.get(uid))
            .cloned())
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.inner.lock().users.get(&id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .lock()
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn create_workspace(&self, name: &str, owner: Uuid) -> Result<Workspace> {
        let ws = Workspace {
            id: Uuid::new_v4(),
            name: name.into(),
            created_by: owner,
            created_at: Utc::now(),
        };
        let mut inner = self.inner.lock();
        inner.members.insert((ws.id, owner), (Role::Owner, Utc::now()));
        inner.workspaces.insert(ws.id, ws.clone());
        Ok(ws)
    }

    async fn workspace(&self, id: Uuid) -> Result<Option<Workspace>> {
        Ok(self.inner.lock().workspaces.get(&id).cloned())
    }

    async fn workspaces_for_user(&self, user_id: Uuid) -> Result<Vec<(Workspace, Role)>> {
        let inner = self.inner.lock();
        let mut out: Vec<(Workspace, Role)> = inner
            .members
            .iter()
            .filter(|((_, uid), _)| *uid == user_id)
            .filter_map(|((wid, _), (role, _))| {
                inner.workspaces.get(wid).map(|w| (w.clone(), *role))
            })
            .collect();
        out.sort_by_key(|(w, _)| w.created_at);
        Ok(out)
    }

    async fn delete_workspace(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.workspaces.remove(&id);
        inner.members.retain(|(wid, _), _| *wid != id);
        inner.volumes.remove(&id);
        inner.sandboxes.retain(|_, sb| sb.workspace_id != id);
        Ok(())
    }

    async fn member_role(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
        Ok(self
            .inner
            .lock()
            .members
            .get(&(workspace_id, user_id))
            .map(|(role, _)| *role))
    }

    async fn upsert_member(&self, workspace_id: Uuid, user_id: Uuid, role: Role) -> Result<()> {
        self.inner
            .lock()
            .members
            .insert((workspace_id, user_id), (role, Utc::now()));
        Ok(())
    }

    async fn remove_member(&self, workspace_id: Uuid, user_id: Uuid) -> Result<()> {
        self.inner.lock().members.remove(&(workspace_id, user_id));
        Ok(())
    }

    async fn list_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>> {
        let inner = self.inner.lock();
        let mut out: Vec<WorkspaceMember> = inner
            .members
            .iter()
            .filter(|((wid, _), _)| *wid == workspace_id)
            .map(|((wid, uid), (role, added_at))| WorkspaceMember {
                workspace_id: *wid,
                user_id: *uid,
                email: inner
                    .users
                    .get(uid)
                    .map(|u| u.email.clone())
                    .unwrap_or_default(),
                role: *role,
                added_at: *added_at,
            })
            .collect();
        out.sort_by_key(|m| m.added_at);
        Ok(out)
    }

    async fn workspace_volume(&self, workspace_id: Uuid) -> Result<Option<WorkspaceVolume>> {
        Ok(self.inner.lock().volumes.get(&workspace_id).cloned())
    }

    async fn record_workspace_volume(
        &self,
        workspace_id: Uuid,
        volume_name: &str,
        size_bytes: i64,
    ) -> Result<()> {
        self.inner.lock().volumes.entry(workspace_id).or_insert(WorkspaceVolume {
            workspace_id,
            volume_name: volume_name.into(),
            size_bytes,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn insert_sandbox(&self, new: &NewSandbox) -> Result<Sandbox> {
        let mut inner = self.inner.lock();
        if inner
            .sandboxes
            .values()
            .any(|sb| sb.short_id.eq_ignore_ascii_case(&new.short_id))
        {
            return Err(Error::Conflict(format!(
                "short_id {} already taken",
                new.short_id
            )));
        }
        let now = Utc::now();
        let sandbox = Sandbox {
            id: new.id,
            short_id: new.short_id.clone(),
            workspace_id: new.workspace_id,
            name: new.name.clone(),
            kind: new.kind,
            status: SandboxStatus::Creating,
            endpoint: None,
            proxy_token: new.proxy_token.clone(),
            sandbox_token: new.sandbox_token.clone(),
            tunnel_token: new.tunnel_token.clone(),
            cpu_millicores: new.cpu_millicores,
            memory_bytes: new.memory_bytes,
            idle_timeout_secs: new.idle_timeout_secs,
            created_by: new.created_by,
            created_at: now,
            last_activity_at: now,
            last_heartbeat_at: None,
            paused_at: None,
        };
        inner.sandboxes.insert(sandbox.id, sandbox.clone());
        Ok(sandbox)
    }

    async fn sandbox(&self, id: Uuid) -> Result<Option<Sandbox>> {
        Ok(self.inner.lock().sandboxes.get(&id).cloned())
    }

    async fn sandbox_by_short_id(&self, short_id: &str) -> Result<Option<Sandbox>> {
        Ok(self
            .inner
            .lock()
            .sandboxes
            .values()
            .find(|sb| sb.short_id.eq_ignore_ascii_case(short_id))
            .cloned())
    }

    async fn sandbox_by_proxy_token(&self, token: &str) -> Result<Option<Sandbox>> {
        Ok(self
            .inner
            .lock()
            .sandboxes
            .values()
            .find(|sb| sb.proxy_token == token)
            .cloned())
    }

    async fn sandboxes_in_workspace(&self, workspace_id: Uuid) -> Result<Vec<Sandbox>> {
        let mut out: Vec<Sandbox> = self
            .inner
            .lock()
            .sandboxes
            .values()
            .filter(|sb| sb.workspace_id == workspace_id)
            .cloned()
            .collect();
        out.sort_by_key(|sb| sb.created_at);
        Ok(out)
    }

    async fn sandboxes_with_status(&self, status: SandboxStatus) -> Result<Vec<Sandbox>> {
        Ok(self
            .inner
            .lock()
            .sandboxes
            .values()
            .filter(|sb| sb.status == status)
            .cloned()
            .collect())
    }

    async fn all_sandboxes(&self) -> Result<Vec<Sandbox>> {
        Ok(self.inner.lock().sandboxes.values().cloned().collect())
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: SandboxStatus,
        to: SandboxStatus,
        endpoint: EndpointChange,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let sandbox = inner
            .sandboxes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {id}")))?;
        if sandbox.status != from {
            return Err(Error::Conflict(format!(
                "sandbox {id} is {}, expected {}",
                sandbox.status, from
            )));
        }
        sandbox.status = to;
        match endpoint {
            EndpointChange::Keep => {}
            EndpointChange::Set(ep) => sandbox.endpoint = Some(ep),
            EndpointChange::Clear => sandbox.endpoint = None,
        }
        match to {
            SandboxStatus::Paused => sandbox.paused_at = Some(Utc::now()),
            SandboxStatus::Running => sandbox.paused_at = None,
            _ => {}
        }
        Ok(())
    }

    async fn touch_activity(&self, id: Uuid) -> Result<()> {
        if let Some(sb) = self.inner.lock().sandboxes.get_mut(&id) {
            sb.last_activity_at = Utc::now();
        }
        Ok(())
    }

    async fn touch_heartbeat(&self, id: Uuid) -> Result<()> {
        if let Some(sb) = self.inner.lock().sandboxes.get_mut(&id) {
            sb.last_heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn rotate_tunnel_token(&self, id: Uuid, token: &str) -> Result<()> {
        if let Some(sb) = self.inner.lock().sandboxes.get_mut(&id) {
            sb.tunnel_token = Some(token.into());
        }
        Ok(())
    }

    async fn remove_sandbox(&self, id: Uuid) -> Result<()> {
        self.inner.lock().sandboxes.remove(&id);
        Ok(())
    }

    async fn workspace_usage(&self, workspace_id: Uuid) -> Result<QuotaUsage> {
        let inner = self.inner.lock();
        let mut usage = QuotaUsage::default();
        for sb in inner.sandboxes.values() {
            if sb.workspace_id == workspace_id && sb.status != SandboxStatus::Deleting {
                usage.sandboxes += 1;
                usage.cpu_millicores += sb.cpu_millicores;
                usage.memory_bytes += sb.memory_bytes;
            }
        }
        Ok(usage)
    }

    async fn workspace_quota(&self, workspace_id: Uuid) -> Result<Option<QuotaLimits>> {
        Ok(self.inner.lock().workspace_quotas.get(&workspace_id).copied())
    }

    async fn user_quota(&self, user_id: Uuid) -> Result<Option<QuotaLimits>> {
        Ok(self.inner.lock().user_quotas.get(&user_id).copied())
    }

    async fn insert_registration_code(
        &self,
        code_digest: &str,
        workspace_id: Uuid,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.lock().codes.insert(
            code_digest.into(),
            CodeRow {
                workspace_id,
                user_id,
                expires_at,
                redeemed_at: None,
            },
        );
        Ok(())
    }

    async fn redeem_registration_code(&self, code_digest: &str) -> Result<Option<CodeBinding>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        match inner.codes.get_mut(code_digest) {
            Some(code) if code.redeemed_at.is_none() && code.expires_at > now => {
                code.redeemed_at = Some(now);
                Ok(Some(CodeBinding {
                    workspace_id: code.workspace_id,
                    user_id: code.user_id,
                }))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dd_domain::SandboxKind;

    fn new_sandbox(workspace_id: Uuid, user: Uuid, short_id: &str) -> NewSandbox {
        NewSandbox {
            id: Uuid::new_v4(),
            short_id: short_id.into(),
            workspace_id,
            name: "dev".into(),
            kind: SandboxKind::Cloud,
            proxy_token: dd_domain::token::generate_secret(),
            sandbox_token: dd_domain::token::generate_secret(),
            tunnel_token: None,
            cpu_millicores: 500,
            memory_bytes: 1 << 30,
            idle_timeout_secs: None,
            created_by: user,
        }
    }

    #[tokio::test]
    async fn short_id_uniqueness_is_case_insensitive() {
        let store = MemStore::new();
        let user = store.add_user("a@example.com");
        let ws = store.create_workspace("w", user).await.unwrap();
        store
            .insert_sandbox(&new_sandbox(ws.id, user, "abcdef0123456789"))
            .await
            .unwrap();
        let err = store
            .insert_sandbox(&new_sandbox(ws.id, user, "ABCDEF0123456789"))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn cas_update_rejects_stale_writers() {
        let store = MemStore::new();
        let user = store.add_user("a@example.com");
        let ws = store.create_workspace("w", user).await.unwrap();
        let sb = store
            .insert_sandbox(&new_sandbox(ws.id, user, "abcdef0123456789"))
            .await
            .unwrap();
        store
            .update_status(
                sb.id,
                SandboxStatus::Creating,
                SandboxStatus::Running,
                EndpointChange::Set("10.0.0.1:8080".into()),
            )
            .await
            .unwrap();
        assert_eq!(
            store.sandbox(sb.id).await.unwrap().unwrap().endpoint.as_deref(),
            Some("10.0.0.1:8080")
        );
        let err = store
            .update_status(
                sb.id,
                SandboxStatus::Creating,
                SandboxStatus::Running,
                EndpointChange::Keep,
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn codes_are_single_use_and_ttl_bound() {
        let store = MemStore::new();
        let user = store.add_user("a@example.com");
        let ws = store.create_workspace("w", user).await.unwrap();

        store
            .insert_registration_code("d1", ws.id, user, Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(store.redeem_registration_code("d1").await.unwrap().is_some());
        assert!(store.redeem_registration_code("d1").await.unwrap().is_none());

        store
            .insert_registration_code("d2", ws.id, user, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(store.redeem_registration_code("d2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn workspace_delete_cascades_sandboxes() {
        let store = MemStore::new();
        let user = store.add_user("a@example.com");
        let ws = store.create_workspace("w", user).await.unwrap();
        store
            .insert_sandbox(&new_sandbox(ws.id, user, "abcdef0123456789"))
            .await
            .unwrap();
        store.delete_workspace(ws.id).await.unwrap();
        assert!(store.all_sandboxes().await.unwrap().is_empty());
        assert!(store.workspaces_for_user(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn usage_excludes_deleting_rows() {
        let store = MemStore::new();
        let user = store.add_user("a@example.com");
        let ws = store.create_workspace("w", user).await.unwrap();
        let sb = store
            .insert_sandbox(&new_sandbox(ws.id, user, "abcdef0123456789"))
            .await
            .unwrap();
        store
            .insert_sandbox(&new_sandbox(ws.id, user, "bbcdef0123456789"))
            .await
            .unwrap();
        store
            .update_status(
                sb.id,
                SandboxStatus::Creating,
                SandboxStatus::Deleting,
                EndpointChange::Clear,
            )
            .await
            .unwrap();
        let usage = store.workspace_usage(ws.id).await.unwrap();
        assert_eq!(usage.sandboxes, 1);
        assert_eq!(usage.cpu_millicores, 500);
    }
}
