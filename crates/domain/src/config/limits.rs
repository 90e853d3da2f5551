use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeouts & control-loop cadences
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Workspace-default idle timeout before a running cloud sandbox is
    /// paused. A sandbox row may override this.
    #[serde(default = "d_idle_timeout")]
    pub idle_timeout_secs: i64,
    /// Local sandboxes with no tunnel heartbeat for this long go offline.
    #[serde(default = "d_heartbeat_timeout")]
    pub heartbeat_timeout_secs: i64,
    /// Reaper tick cadence.
    #[serde(default = "d_reap_interval")]
    pub reap_interval_secs: u64,
    /// Backend readiness polling: cadence and total budget.
    #[serde(default = "d_ready_poll")]
    pub readiness_poll_secs: u64,
    #[serde(default = "d_ready_budget")]
    pub readiness_budget_secs: u64,
    /// Registration codes expire after this many seconds (ceiling 900).
    #[serde(default = "d_code_ttl")]
    pub registration_code_ttl_secs: i64,
    /// Tunnel liveness: server ping cadence and silence tolerance.
    #[serde(default = "d_ping_interval")]
    pub tunnel_ping_interval_secs: u64,
    #[serde(default = "d_tunnel_timeout")]
    pub tunnel_read_timeout_secs: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: d_idle_timeout(),
            heartbeat_timeout_secs: d_heartbeat_timeout(),
            reap_interval_secs: d_reap_interval(),
            readiness_poll_secs: d_ready_poll(),
            readiness_budget_secs: d_ready_budget(),
            registration_code_ttl_secs: d_code_ttl(),
            tunnel_ping_interval_secs: d_ping_interval(),
            tunnel_read_timeout_secs: d_tunnel_timeout(),
        }
    }
}

impl LimitsConfig {
    /// Registration-code TTL, clamped to the 15-minute ceiling.
    pub fn code_ttl_secs(&self) -> i64 {
        self.registration_code_ttl_secs.clamp(1, 900)
    }
}

fn d_idle_timeout() -> i64 {
    1800
}
fn d_heartbeat_timeout() -> i64 {
    90
}
fn d_reap_interval() -> u64 {
    60
}
fn d_ready_poll() -> u64 {
    2
}
fn d_ready_budget() -> u64 {
    300
}
fn d_code_ttl() -> i64 {
    900
}
fn d_ping_interval() -> u64 {
    25
}
fn d_tunnel_timeout() -> i64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_ttl_is_clamped_to_fifteen_minutes() {
        let mut l = LimitsConfig::default();
        l.registration_code_ttl_secs = 3600;
        assert_eq!(l.code_ttl_secs(), 900);
        l.registration_code_ttl_secs = 60;
        assert_eq!(l.code_ttl_secs(), 60);
    }
}
