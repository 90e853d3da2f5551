//! PostgreSQL implementation of [`Store`].
//!
//! Queries are runtime-checked (`sqlx::query`) so builds never need a live
//! database. Row mapping is manual and kept in one place per table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dd_domain::config::DatabaseConfig;
use dd_domain::quota::{QuotaLimits, QuotaUsage};
use dd_domain::{Error, Result, Role, SandboxKind, SandboxStatus};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{
    CodeBinding, NewSandbox, Sandbox, User, Workspace, WorkspaceMember, WorkspaceVolume,
};
use crate::{EndpointChange, Store};

/// The production store: a Postgres pool plus the embedded migrations.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and bring the schema up to date. Fails fast (startup aborts)
    /// if the database is unreachable within the acquire timeout.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| Error::Database(format!("connect: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Database(format!("migrate: {e}")))?;

        tracing::info!(max_connections = config.max_connections, "database ready");
        Ok(Self { pool })
    }

    /// Close the pool. Called last during graceful shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ── error & row mapping helpers ─────────────────────────────────────

fn db_err(e: sqlx::Error) -> Error {
    if let Some(dbe) = e.as_database_error() {
        // 23505 = unique_violation; surfaced as Conflict so callers can
        // redraw short-IDs or report duplicates.
        if dbe.code().as_deref() == Some("23505") {
            return Error::Conflict(format!("unique violation: {dbe}"));
        }
    }
    Error::Database(e.to_string())
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id").map_err(db_err)?,
        email: row.try_get("email").map_err(db_err)?,
        display_name: row.try_get("display_name").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn workspace_from_row(row: &PgRow) -> Result<Workspace> {
    Ok(Workspace {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        created_by: row.try_get("created_by").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn sandbox_from_row(row: &PgRow) -> Result<Sandbox> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Sandbox {
        id: row.try_get("id").map_err(db_err)?,
        short_id: row.try_get("short_id").map_err(db_err)?,
        workspace_id: row.try_get("workspace_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        kind: SandboxKind::parse(&kind)?,
        status: SandboxStatus::parse(&status)?,
        endpoint: row.try_get("endpoint").map_err(db_err)?,
        proxy_token: row.try_get("proxy_token").map_err(db_err)?,
        sandbox_token: row.try_get("sandbox_token").map_err(db_err)?,
        tunnel_token: row.try_get("tunnel_token").map_err(db_err)?,
        cpu_millicores: row.try_get("cpu_millicores").map_err(db_err)?,
        memory_bytes: row.try_get("memory_bytes").map_err(db_err)?,
        idle_timeout_secs: row.try_get("idle_timeout_secs").map_err(db_err)?,
        created_by: row.try_get("created_by").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        last_activity_at: row.try_get("last_activity_at").map_err(db_err)?,
        last_heartbeat_at: row.try_get("last_heartbeat_at").map_err(db_err)?,
        paused_at: row.try_get("paused_at").map_err(db_err)?,
    })
}

fn quota_from_row(row: &PgRow) -> Result<QuotaLimits> {
    Ok(QuotaLimits {
        max_sandboxes: row.try_get("max_sandboxes").map_err(db_err)?,
        max_cpu_millicores: row.try_get("max_cpu_millicores").map_err(db_err)?,
        max_memory_bytes: row.try_get("max_memory_bytes").map_err(db_err)?,
        max_idle_timeout_secs: row.try_get("max_idle_timeout_secs").map_err(db_err)?,
        max_drive_bytes: row.try_get("max_drive_bytes").map_err(db_err)?,
    })
}

const SANDBOX_COLS: &str = "id, short_id, workspace_id, name, kind, status, endpoint, \
     proxy_token, sandbox_token, tunnel_token, cpu_millicores, memory_bytes, \
     idle_timeout_secs, created_by, created_at, last_activity_at, last_heartbeat_at, paused_at";

#[async_trait]
impl Store for PgStore {
    // ── Users & auth ──────────────────────────────────────────────────

    async fn user_by_session_digest(&self, digest: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT u.id, u.email, u.display_name, u.created_at
             FROM users u
             JOIN auth_tokens t ON t.user_id = u.id
             WHERE t.token_hash = $1 AND t.expires_at > now()",
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, display_name, created_at FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, display_name, created_at FROM users WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    // ── Workspaces & membership ───────────────────────────────────────

    async fn create_workspace(&self, name: &str, owner: Uuid) -> Result<Workspace> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let id = Uuid::new_v4();
        let row = sqlx::query(
            "INSERT INTO workspaces (id, name, created_by)
             VALUES ($1, $2, $3)
             RETURNING id, name, created_by, created_at",
        )
        .bind(id)
        .bind(name)
        .bind(owner)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO workspace_members (workspace_id, user_id, role) VALUES ($1, $2, $3)",
        )
        .bind(id)
        .bind(owner)
        .bind(Role::Owner.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        workspace_from_row(&row)
    }

    async fn workspace(&self, id: Uuid) -> Result<Option<Workspace>> {
        let row = sqlx::query(
            "SELECT id, name, created_by, created_at FROM workspaces WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(workspace_from_row).transpose()
    }

    async fn workspaces_for_user(&self, user_id: Uuid) -> Result<Vec<(Workspace, Role)>> {
        let rows = sqlx::query(
            "SELECT w.id, w.name, w.created_by, w.created_at, m.role
             FROM workspaces w
             JOIN workspace_members m ON m.workspace_id = w.id
             WHERE m.user_id = $1
             ORDER BY w.created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let role: String = row.try_get("role").map_err(db_err)?;
                Ok((workspace_from_row(row)?, Role::parse(&role)?))
            })
            .collect()
    }

    async fn delete_workspace(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM workspaces WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn member_role(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
        let row = sqlx::query(
            "SELECT role FROM workspace_members WHERE workspace_id = $1 AND user_id = $2",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => {
                let role: String = row.try_get("role").map_err(db_err)?;
                Ok(Some(Role::parse(&role)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_member(&self, workspace_id: Uuid, user_id: Uuid, role: Role) -> Result<()> {
        sqlx::query(
            "INSERT INTO workspace_members (workspace_id, user_id, role)
             VALUES ($1, $2, $3)
             ON CONFLICT (workspace_id, user_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(workspace_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_member(&self, workspace_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM workspace_members WHERE workspace_id = $1 AND user_id = $2")
            .bind(workspace_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>> {
        let rows = sqlx::query(
            "SELECT m.workspace_id, m.user_id, u.email, m.role, m.added_at
             FROM workspace_members m
             JOIN users u ON u.id = m.user_id
             WHERE m.workspace_id = $1
             ORDER BY m.added_at",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let role: String = row.try_get("role").map_err(db_err)?;
                Ok(WorkspaceMember {
                    workspace_id: row.try_get("workspace_id").map_err(db_err)?,
                    user_id: row.try_get("user_id").map_err(db_err)?,
                    email: row.try_get("email").map_err(db_err)?,
                    role: Role::parse(&role)?,
                    added_at: row.try_get("added_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    // ── Workspace volumes ─────────────────────────────────────────────

    async fn workspace_volume(&self, workspace_id: Uuid) -> Result<Option<WorkspaceVolume>> {
        let row = sqlx::query(
            "SELECT workspace_id, volume_name, size_bytes, created_at
             FROM workspace_volumes WHERE workspace_id = $1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => Ok(Some(WorkspaceVolume {
                workspace_id: row.try_get("workspace_id").map_err(db_err)?,
                volume_name: row.try_get("volume_name").map_err(db_err)?,
                size_bytes: row.try_get("size_bytes").map_err(db_err)?,
                created_at: row.try_get("created_at").map_err(db_err)?,
            })),
            None => Ok(None),
        }
    }

    async fn record_workspace_volume(
        &self,
        workspace_id: Uuid,
        volume_name: &str,
        size_bytes: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO workspace_volumes (workspace_id, volume_name, size_bytes)
             VALUES ($1, $2, $3)
             ON CONFLICT (workspace_id) DO NOTHING",
        )
        .bind(workspace_id)
        .bind(volume_name)
        .bind(size_bytes)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    // ── Sandboxes ─────────────────────────────────────────────────────

    async fn insert_sandbox(&self, new: &NewSandbox) -> Result<Sandbox> {
        let query = format!(
            "INSERT INTO sandboxes (id, short_id, workspace_id, name, kind, status,
                 proxy_token, sandbox_token, tunnel_token,
                 cpu_millicores, memory_bytes, idle_timeout_secs, created_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             RETURNING {SANDBOX_COLS}"
        );
        let row = sqlx::query(&query)
            .bind(new.id)
            .bind(&new.short_id)
            .bind(new.workspace_id)
            .bind(&new.name)
            .bind(new.kind.as_str())
            .bind(SandboxStatus::Creating.as_str())
            .bind(&new.proxy_token)
            .bind(&new.sandbox_token)
            .bind(&new.tunnel_token)
            .bind(new.cpu_millicores)
            .bind(new.memory_bytes)
            .bind(new.idle_timeout_secs)
            .bind(new.created_by)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        sandbox_from_row(&row)
    }

    async fn sandbox(&self, id: Uuid) -> Result<Option<Sandbox>> {
        let query = format!("SELECT {SANDBOX_COLS} FROM sandboxes WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(sandbox_from_row).transpose()
    }

    async fn sandbox_by_short_id(&self, short_id: &str) -> Result<Option<Sandbox>> {
        let query =
            format!("SELECT {SANDBOX_COLS} FROM sandboxes WHERE lower(short_id) = lower($1)");
        let row = sqlx::query(&query)
            .bind(short_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(sandbox_from_row).transpose()
    }

    async fn sandbox_by_proxy_token(&self, token: &str) -> Result<Option<Sandbox>> {
        let query = format!("SELECT {SANDBOX_COLS} FROM sandboxes WHERE proxy_token = $1");
        let row = sqlx::query(&query)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(sandbox_from_row).transpose()
    }

    async fn sandboxes_in_workspace(&self, workspace_id: Uuid) -> Result<Vec<Sandbox>> {
        let query = format!(
            "SELECT {SANDBOX_COLS} FROM sandboxes WHERE workspace_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query(&query)
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(sandbox_from_row).collect()
    }

    async fn sandboxes_with_status(&self, status: SandboxStatus) -> Result<Vec<Sandbox>> {
        let query = format!("SELECT {SANDBOX_COLS} FROM sandboxes WHERE status = $1");
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(sandbox_from_row).collect()
    }

    async fn all_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let query = format!("SELECT {SANDBOX_COLS} FROM sandboxes");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(sandbox_from_row).collect()
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: SandboxStatus,
        to: SandboxStatus,
        endpoint: EndpointChange,
    ) -> Result<()> {
        const PAUSED_AT: &str = "paused_at = CASE \
             WHEN $3 = 'paused' THEN now() \
             WHEN $3 = 'running' THEN NULL \
             ELSE paused_at END";
        let result = match &endpoint {
            EndpointChange::Keep => {
                let query = format!(
                    "UPDATE sandboxes SET status = $3, {PAUSED_AT} \
                     WHERE id = $1 AND status = $2"
                );
                sqlx::query(&query)
                    .bind(id)
                    .bind(from.as_str())
                    .bind(to.as_str())
                    .execute(&self.pool)
                    .await
            }
            EndpointChange::Set(ep) => {
                let query = format!(
                    "UPDATE sandboxes SET status = $3, endpoint = $4, {PAUSED_AT} \
                     WHERE id = $1 AND status = $2"
                );
                sqlx::query(&query)
                    .bind(id)
                    .bind(from.as_str())
                    .bind(to.as_str())
                    .bind(ep)
                    .execute(&self.pool)
                    .await
            }
            EndpointChange::Clear => {
                let query = format!(
                    "UPDATE sandboxes SET status = $3, endpoint = NULL, {PAUSED_AT} \
                     WHERE id = $1 AND status = $2"
                );
                sqlx::query(&query)
                    .bind(id)
                    .bind(from.as_str())
                    .bind(to.as_str())
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            // Distinguish "row gone" from "status moved underneath us".
            return match self.sandbox(id).await? {
                Some(current) => Err(Error::Conflict(format!(
                    "sandbox {id} is {}, expected {}",
                    current.status, from
                ))),
                None => Err(Error::NotFound(format!("sandbox {id}"))),
            };
        }
        Ok(())
    }

    async fn touch_activity(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET last_activity_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn touch_heartbeat(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET last_heartbeat_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn rotate_tunnel_token(&self, id: Uuid, token: &str) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET tunnel_token = $2 WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn remove_sandbox(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM sandboxes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn workspace_usage(&self, workspace_id: Uuid) -> Result<QuotaUsage> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS sandboxes,
                    COALESCE(SUM(cpu_millicores), 0)::BIGINT AS cpu_millicores,
                    COALESCE(SUM(memory_bytes), 0)::BIGINT AS memory_bytes
             FROM sandboxes
             WHERE workspace_id = $1 AND status <> 'deleting'",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(QuotaUsage {
            sandboxes: row.try_get("sandboxes").map_err(db_err)?,
            cpu_millicores: row.try_get("cpu_millicores").map_err(db_err)?,
            memory_bytes: row.try_get("memory_bytes").map_err(db_err)?,
        })
    }

    // ── Quotas ────────────────────────────────────────────────────────

    async fn workspace_quota(&self, workspace_id: Uuid) -> Result<Option<QuotaLimits>> {
        let row = sqlx::query(
            "SELECT max_sandboxes, max_cpu_millicores, max_memory_bytes,
                    max_idle_timeout_secs, max_drive_bytes
             FROM workspace_quotas WHERE workspace_id = $1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(quota_from_row).transpose()
    }

    async fn user_quota(&self, user_id: Uuid) -> Result<Option<QuotaLimits>> {
        let row = sqlx::query(
            "SELECT max_sandboxes, max_cpu_millicores, max_memory_bytes,
                    max_idle_timeout_secs, max_drive_bytes
             FROM user_quotas WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(quota_from_row).transpose()
    }

    // ── Registration codes ────────────────────────────────────────────

    async fn insert_registration_code(
        &self,
        code_digest: &str,
        workspace_id: Uuid,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_registration_codes (code_hash, workspace_id, user_id, expires_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(code_digest)
        .bind(workspace_id)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn redeem_registration_code(&self, code_digest: &str) -> Result<Option<CodeBinding>> {
        let row = sqlx::query(
            "UPDATE agent_registration_codes
             SET redeemed_at = now()
             WHERE code_hash = $1 AND redeemed_at IS NULL AND expires_at > now()
             RETURNING workspace_id, user_id",
        )
        .bind(code_digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => Ok(Some(CodeBinding {
                workspace_id: row.try_get("workspace_id").map_err(db_err)?,
                user_id: row.try_get("user_id").map_err(db_err)?,
            })),
            None => Ok(None),
        }
    }
}
