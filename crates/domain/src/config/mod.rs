mod backend;
mod database;
mod limits;
mod routing;
mod server;
mod upstream;

pub use backend::*;
pub use database::*;
pub use limits::*;
pub use routing::*;
pub use server::*;
pub use upstream::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Config {
    /// Load the config: optional TOML file (`DRYDOCK_CONFIG` path or
    /// `drydock.toml` in the working directory), then environment overrides
    /// on top. Env always wins so container deployments need no file.
    pub fn load() -> crate::Result<Self> {
        let path = std::env::var("DRYDOCK_CONFIG").unwrap_or_else(|_| "drydock.toml".into());
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw).map_err(|e| {
                crate::Error::Validation(format!("config file {path}: {e}"))
            })?,
            Err(_) => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply the documented environment variables over the loaded file.
    pub fn apply_env(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = var("BASE_DOMAIN") {
            self.routing.base_domain = v;
        }
        if let Some(v) = var("BASE_SCHEME") {
            self.routing.base_scheme = v;
        }
        if let Some(v) = var("IDLE_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.limits.idle_timeout_secs = v;
        }
        if let Some(v) = var("AGENT_IMAGE") {
            self.backend.agent_image = v;
        }
        if let Some(v) = var("SANDBOX_NAMESPACE") {
            self.backend.sandbox_namespace = v;
        }
        if let Some(v) = var("RUNTIME_CLASS") {
            self.backend.runtime_class = Some(v);
        }
        if let Some(v) = var("STORAGE_CLASS") {
            self.backend.storage_class = Some(v);
        }
        if let Some(v) = var("UPSTREAM_BASE_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = var("DRYDOCK_BACKEND").and_then(|v| BackendKind::parse(&v)) {
            self.backend.kind = v;
        }
        if let Some(v) = var("DRYDOCK_HOST") {
            self.server.host = v;
        }
        if let Some(v) = var("DRYDOCK_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
    }

    /// Validate the assembled config. Startup aborts on any `Error`.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        fn issue(severity: ConfigSeverity, field: &str, message: impl Into<String>) -> ConfigIssue {
            ConfigIssue { severity, field: field.into(), message: message.into() }
        }

        let mut issues = Vec::new();
        if self.database.url.is_empty() {
            issues.push(issue(ConfigSeverity::Error, "database.url", "DATABASE_URL is required"));
        }
        if self.routing.base_domain.is_empty() {
            issues.push(issue(
                ConfigSeverity::Error,
                "routing.base_domain",
                "BASE_DOMAIN is required",
            ));
        }
        if self.routing.base_scheme != "http" && self.routing.base_scheme != "https" {
            issues.push(issue(
                ConfigSeverity::Error,
                "routing.base_scheme",
                format!("must be http or https, got {:?}", self.routing.base_scheme),
            ));
        }
        if self.upstream.base_url.is_empty() {
            issues.push(issue(
                ConfigSeverity::Warning,
                "upstream.base_url",
                "UPSTREAM_BASE_URL unset — the upstream API proxy will reject requests",
            ));
        }
        if self.backend.agent_image.is_empty() {
            issues.push(issue(ConfigSeverity::Error, "backend.agent_image", "AGENT_IMAGE is required"));
        }
        if self.limits.idle_timeout_secs <= 0 {
            issues.push(issue(
                ConfigSeverity::Error,
                "limits.idle_timeout_secs",
                "IDLE_TIMEOUT must be positive",
            ));
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut c = Config::default();
        c.database.url = "postgres://localhost/drydock".into();
        c.routing.base_domain = "sandbox.example.com".into();
        c.upstream.base_url = "https://api.anthropic.com".into();
        c.backend.agent_image = "drydock/agent:latest".into();
        c
    }

    #[test]
    fn default_config_fails_validation() {
        let issues = Config::default().validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "database.url"));
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "routing.base_domain"));
    }

    #[test]
    fn filled_config_passes() {
        let issues = valid_config().validate();
        assert!(
            !issues.iter().any(|i| i.severity == ConfigSeverity::Error),
            "unexpected errors: {issues:?}"
        );
    }

    #[test]
    fn bad_scheme_is_an_error() {
        let mut c = valid_config();
        c.routing.base_scheme = "gopher".into();
        assert!(c
            .validate()
            .iter()
            .any(|i| i.field == "routing.base_scheme" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn missing_upstream_is_only_a_warning() {
        let mut c = valid_config();
        c.upstream.base_url.clear();
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "upstream.base_url" && i.severity == ConfigSeverity::Warning));
        assert!(!issues.iter().any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn toml_round_trip() {
        let c = valid_config();
        let raw = toml::to_string(&c).unwrap();
        let back: Config = toml::from_str(&raw).unwrap();
        assert_eq!(back.routing.base_domain, "sandbox.example.com");
        assert_eq!(back.server.port, c.server.port);
    }
}
