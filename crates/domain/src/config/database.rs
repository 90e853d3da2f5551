use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection string. Usually supplied via `DATABASE_URL`.
    #[serde(default)]
    pub url: String,
    #[serde(default = "d_max_connections")]
    pub max_connections: u32,
    /// Acquire timeout for pool checkouts.
    #[serde(default = "d_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: d_max_connections(),
            acquire_timeout_secs: d_acquire_timeout(),
        }
    }
}

fn d_max_connections() -> u32 {
    10
}
fn d_acquire_timeout() -> u64 {
    5
}
