use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing (subdomains + cookies)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Parent domain under which sandbox subdomains live
    /// (`<short_id>.<base_domain>`).
    #[serde(default)]
    pub base_domain: String,
    #[serde(default = "d_scheme")]
    pub base_scheme: String,
    /// Name of the browser session cookie the auth collaborator issues.
    #[serde(default = "d_cookie")]
    pub session_cookie: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_domain: String::new(),
            base_scheme: d_scheme(),
            session_cookie: d_cookie(),
        }
    }
}

impl RoutingConfig {
    /// Login URL on the parent domain, so the re-issued cookie is scoped to
    /// the whole base domain rather than one sandbox subdomain.
    pub fn login_url(&self) -> String {
        format!("{}://{}/login", self.base_scheme, self.base_domain)
    }

    /// Extract a sandbox short-ID from a request `Host` header, if the host
    /// is a first-level subdomain of the base domain.
    pub fn short_id_from_host(&self, host: &str) -> Option<String> {
        let host = host.split(':').next().unwrap_or(host);
        let prefix = host.strip_suffix(&self.base_domain)?;
        let label = prefix.strip_suffix('.')?;
        if label.is_empty() || label.contains('.') {
            return None;
        }
        Some(label.to_ascii_lowercase())
    }
}

fn d_scheme() -> String {
    "https".into()
}
fn d_cookie() -> String {
    "drydock_session".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing() -> RoutingConfig {
        RoutingConfig {
            base_domain: "box.example.com".into(),
            ..RoutingConfig::default()
        }
    }

    #[test]
    fn short_id_extraction() {
        let r = routing();
        assert_eq!(
            r.short_id_from_host("a1b2c3d4e5f6a7b8.box.example.com"),
            Some("a1b2c3d4e5f6a7b8".into())
        );
        // Port suffix is ignored.
        assert_eq!(
            r.short_id_from_host("abc.box.example.com:443"),
            Some("abc".into())
        );
        // Case-insensitive host.
        assert_eq!(
            r.short_id_from_host("ABC.box.example.com"),
            Some("abc".into())
        );
    }

    #[test]
    fn base_domain_itself_is_not_a_sandbox() {
        let r = routing();
        assert_eq!(r.short_id_from_host("box.example.com"), None);
    }

    #[test]
    fn deeper_subdomains_are_rejected() {
        let r = routing();
        assert_eq!(r.short_id_from_host("x.y.box.example.com"), None);
        // Suffix match without a dot boundary must not count.
        assert_eq!(r.short_id_from_host("evilbox.example.com"), None);
    }

    #[test]
    fn login_url_uses_parent_domain() {
        assert_eq!(routing().login_url(), "https://box.example.com/login");
    }
}
