//! Quota ceilings consulted by the lifecycle manager on create.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-user or per-workspace ceilings. A `0` ceiling means "unlimited" so
/// operators can leave rows unset without blocking creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_sandboxes: i64,
    pub max_cpu_millicores: i64,
    pub max_memory_bytes: i64,
    pub max_idle_timeout_secs: i64,
    pub max_drive_bytes: i64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_sandboxes: 10,
            max_cpu_millicores: 8_000,
            max_memory_bytes: 16 * 1024 * 1024 * 1024,
            max_idle_timeout_secs: 4 * 3600,
            max_drive_bytes: 50 * 1024 * 1024 * 1024,
        }
    }
}

/// Current usage within a workspace, summed over non-deleting sandboxes.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaUsage {
    pub sandboxes: i64,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
}

/// A sandbox create request, as far as quotas are concerned.
#[derive(Debug, Clone, Copy)]
pub struct ResourceRequest {
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    pub idle_timeout_secs: Option<i64>,
}

/// Validate a create against the ceiling and current usage.
/// Fails closed with `Validation`, never mutating anything.
pub fn check_create(
    limits: &QuotaLimits,
    usage: &QuotaUsage,
    req: &ResourceRequest,
) -> Result<()> {
    if req.cpu_millicores <= 0 || req.memory_bytes <= 0 {
        return Err(Error::Validation(
            "cpu and memory requests must be positive".into(),
        ));
    }
    if limits.max_sandboxes > 0 && usage.sandboxes + 1 > limits.max_sandboxes {
        return Err(Error::Validation(format!(
            "sandbox quota exceeded ({}/{})",
            usage.sandboxes, limits.max_sandboxes
        )));
    }
    if limits.max_cpu_millicores > 0
        && usage.cpu_millicores + req.cpu_millicores > limits.max_cpu_millicores
    {
        return Err(Error::Validation(format!(
            "cpu quota exceeded ({} + {} > {} millicores)",
            usage.cpu_millicores, req.cpu_millicores, limits.max_cpu_millicores
        )));
    }
    if limits.max_memory_bytes > 0
        && usage.memory_bytes + req.memory_bytes > limits.max_memory_bytes
    {
        return Err(Error::Validation(format!(
            "memory quota exceeded ({} + {} > {} bytes)",
            usage.memory_bytes, req.memory_bytes, limits.max_memory_bytes
        )));
    }
    if let Some(idle) = req.idle_timeout_secs {
        if idle <= 0 {
            return Err(Error::Validation("idle timeout must be positive".into()));
        }
        if limits.max_idle_timeout_secs > 0 && idle > limits.max_idle_timeout_secs {
            return Err(Error::Validation(format!(
                "idle timeout {}s exceeds maximum {}s",
                idle, limits.max_idle_timeout_secs
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(cpu: i64, mem: i64) -> ResourceRequest {
        ResourceRequest {
            cpu_millicores: cpu,
            memory_bytes: mem,
            idle_timeout_secs: None,
        }
    }

    #[test]
    fn create_within_limits_passes() {
        let limits = QuotaLimits::default();
        let usage = QuotaUsage::default();
        assert!(check_create(&limits, &usage, &req(1000, 1 << 30)).is_ok());
    }

    #[test]
    fn sandbox_count_ceiling_is_enforced() {
        let limits = QuotaLimits { max_sandboxes: 2, ..QuotaLimits::default() };
        let usage = QuotaUsage { sandboxes: 2, ..QuotaUsage::default() };
        let err = check_create(&limits, &usage, &req(100, 1 << 20)).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn zero_ceiling_means_unlimited() {
        let limits = QuotaLimits {
            max_sandboxes: 0,
            max_cpu_millicores: 0,
            max_memory_bytes: 0,
            ..QuotaLimits::default()
        };
        let usage = QuotaUsage {
            sandboxes: 1_000,
            cpu_millicores: 1 << 40,
            memory_bytes: 1 << 50,
        };
        assert!(check_create(&limits, &usage, &req(100, 1 << 20)).is_ok());
    }

    #[test]
    fn nonpositive_requests_are_rejected() {
        let limits = QuotaLimits::default();
        let usage = QuotaUsage::default();
        assert!(check_create(&limits, &usage, &req(0, 1)).is_err());
        assert!(check_create(&limits, &usage, &req(1, -5)).is_err());
    }

    #[test]
    fn idle_timeout_ceiling_is_enforced() {
        let limits = QuotaLimits { max_idle_timeout_secs: 600, ..QuotaLimits::default() };
        let usage = QuotaUsage::default();
        let over = ResourceRequest {
            cpu_millicores: 100,
            memory_bytes: 1 << 20,
            idle_timeout_secs: Some(601),
        };
        assert!(check_create(&limits, &usage, &over).is_err());
        let ok = ResourceRequest { idle_timeout_secs: Some(600), ..over };
        assert!(check_create(&limits, &usage, &ok).is_ok());
    }
}
