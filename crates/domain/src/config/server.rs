use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_8400")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Maximum concurrently-served requests before backpressure kicks in.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// Per-IP token-bucket rate limiting. `None` disables it.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8400,
            host: "0.0.0.0".into(),
            max_concurrent_requests: d_max_concurrent(),
            rate_limit: None,
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u64,
    pub burst_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. The web frontend is served from the base
    /// domain, so that origin is always added at startup.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: Vec::new() }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_8400() -> u16 {
    8400
}
fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_max_concurrent() -> usize {
    256
}
