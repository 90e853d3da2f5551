use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upstream API proxy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL requests under `/proxy/<vendor>/…` are forwarded to.
    /// Usually supplied via `UPSTREAM_BASE_URL`.
    #[serde(default)]
    pub base_url: String,
    /// Environment variable holding the operator's real API credential.
    /// The key itself never lives in config files.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    /// Idle-read guard while streaming an upstream response.
    #[serde(default = "d_idle_read")]
    pub idle_read_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_env: d_api_key_env(),
            idle_read_timeout_secs: d_idle_read(),
        }
    }
}

fn d_api_key_env() -> String {
    "UPSTREAM_API_KEY".into()
}
fn d_idle_read() -> u64 {
    120
}
